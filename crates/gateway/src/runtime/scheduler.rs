//! Admission control + thread-key routing.
//!
//! The `Scheduler` is the fabric's single entry point for a resolved
//! [`Job`]: it decides which thread a job belongs to, applies auto-resume
//! from durable chat state, and hands the job to that thread's
//! [`ThreadWorker`](crate::runtime::thread_worker), spawning one on first
//! use. Concurrency admission itself is delegated to
//! [`SlotAllocator`](crate::runtime::slot::SlotAllocator) so worker tasks
//! can hold it without a back-reference to the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use aw_domain::config::Config;
use aw_domain::job::Job;
use aw_domain::trace::TraceEvent;
use aw_engine::EngineRegistry;

use crate::runtime::bus::Bus;
use crate::runtime::engine_lock::EngineLock;
use crate::runtime::run::RunDeps;
use crate::runtime::slot::{AdmissionCounts, SlotAllocator};
use crate::runtime::store::Store;
use crate::runtime::thread_worker::{self, WorkerMsg};

/// Derive the routing key a `ThreadWorker` is addressed by. A job carrying
/// a resume token sticks to the thread that token was last used on; a job
/// with no resume yet (new session, or auto-resume disabled) routes on its
/// session key directly.
fn derive_thread_key(job: &Job) -> String {
    job.resume.as_ref().map(|r| r.value.clone()).unwrap_or_else(|| job.session_key.clone())
}

/// Fill in `job.resume`/`job.engine_id` from durable chat state when the
/// caller didn't already supply a resume token. A no-op if auto-resume is
/// disabled globally, disabled for this job, or there's no matching
/// chat state to resume from.
fn apply_auto_resume(config: &Config, store: &dyn Store, job: &mut Job) {
    if !config.scheduler.auto_resume {
        return;
    }
    if job.resume.is_some() {
        return;
    }
    if job.meta_bool("disable_auto_resume") {
        return;
    }

    let Some(chat_state) = store.get_chat_state(&job.session_key) else { return };
    // Only validate against the stored engine when the caller actually named
    // one; a job with no engine preference always adopts the session's.
    if let Some(requested) = job.engine_id.as_deref() {
        if !chat_state.engine_matches(requested) {
            return;
        }
    }

    if job.engine_id.is_none() {
        job.engine_id = Some(chat_state.engine_id.clone());
    }
    job.resume = chat_state.resume.clone();
}

pub struct Scheduler {
    deps: Arc<RunDeps>,
    slots: Arc<SlotAllocator>,
    workers: Mutex<HashMap<String, tokio::sync::mpsc::UnboundedSender<WorkerMsg>>>,
    /// `parent session_key -> thread keys of subagent/background_exec jobs
    /// it spawned`, so cancelling a main-lane session cascades to its
    /// children instead of leaving them to run orphaned.
    cascade_children: Mutex<HashMap<String, Vec<String>>>,
    /// Most recent thread key a session routed through — diverges from the
    /// session key itself once a resume token takes over as the routing key.
    session_threads: Mutex<HashMap<String, String>>,
    /// `run_id -> thread_key`, so `cancel_by_run_id` can address the right
    /// worker without the caller needing to know routing details.
    run_threads: Mutex<HashMap<Uuid, String>>,
}

impl Scheduler {
    pub fn new(engines: Arc<EngineRegistry>, store: Arc<dyn Store>, bus: Arc<Bus>, config: Arc<Config>) -> Arc<Self> {
        let engine_lock = EngineLock::new(config.scheduler.require_engine_lock, config.scheduler.max_lock_age_ms);
        let slots = SlotAllocator::new(config.scheduler.max_concurrent_runs, config.scheduler.slot_stale_ms);
        let deps = Arc::new(RunDeps { engines, engine_lock, store, bus, config });
        Arc::new(Self {
            deps,
            slots,
            workers: Mutex::new(HashMap::new()),
            cascade_children: Mutex::new(HashMap::new()),
            session_threads: Mutex::new(HashMap::new()),
            run_threads: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a job's thread, apply auto-resume, and hand it off. Returns
    /// the `run_id` the caller can use to track this submission (the job's
    /// own id, echoed back for callers that didn't set one explicitly).
    pub fn submit(&self, mut job: Job) -> Uuid {
        apply_auto_resume(&self.deps.config, self.deps.store.as_ref(), &mut job);
        let run_id = job.run_id;
        let thread_key = derive_thread_key(&job);

        self.deps.store.index_session(&job.session_key);
        self.register_cascade_child(&job, &thread_key);
        self.session_threads.lock().insert(job.session_key.clone(), thread_key.clone());
        self.run_threads.lock().insert(run_id, thread_key.clone());

        let sender = self.worker_for(&thread_key);
        TraceEvent::QueueModeApplied {
            session_key: job.session_key.clone(),
            mode: format!("{:?}", job.queue_mode).to_lowercase(),
            outcome: format!("routed_to_thread:{thread_key}"),
        }
        .emit();
        let _ = sender.send(WorkerMsg::Submit(job));
        run_id
    }

    pub fn cancel(&self, thread_key: &str, reason: &str) {
        if let Some(sender) = self.workers.lock().get(thread_key).cloned() {
            let _ = sender.send(WorkerMsg::Cancel(reason.to_owned()));
        }
    }

    /// Cancel by run id: looks up which thread the run was routed to and
    /// cancels whatever is currently active there. Idempotent — cancelling
    /// an id whose run already finished (or was never submitted) is a no-op.
    pub fn cancel_by_run_id(&self, run_id: Uuid, reason: &str) {
        if let Some(thread_key) = self.run_threads.lock().get(&run_id).cloned() {
            self.cancel(&thread_key, reason);
        }
    }

    /// Cancel every thread routed to `session_key` plus, recursively, every
    /// subagent/background_exec job that named it as `parent_session_key` in
    /// its job metadata. A main-lane run's cancellation should not leave its
    /// spawned children running unattended.
    pub fn cancel_by_session(&self, session_key: &str, reason: &str) {
        let thread_key = self.session_threads.lock().get(session_key).cloned().unwrap_or_else(|| session_key.to_owned());
        self.cancel(&thread_key, reason);

        let children = self.cascade_children.lock().remove(session_key).unwrap_or_default();
        for child_session_key in children {
            self.cancel_by_session(&child_session_key, reason);
        }
    }

    /// Alias for [`Scheduler::cancel_by_session`].
    pub fn abort(&self, session_key: &str, reason: &str) {
        self.cancel_by_session(session_key, reason);
    }

    /// Record `job`'s session under its parent session, if it carries one.
    /// A job opts in by setting `meta["parent_session_key"]` — the Router
    /// sets this for any job whose lane is not `Main`.
    fn register_cascade_child(&self, job: &Job, _thread_key: &str) {
        let Some(parent) = job.meta.get("parent_session_key").and_then(|v| v.as_str()) else { return };
        self.cascade_children.lock().entry(parent.to_owned()).or_default().push(job.session_key.clone());
    }

    pub fn steer(&self, thread_key: &str, text: &str) {
        if let Some(sender) = self.workers.lock().get(thread_key).cloned() {
            let _ = sender.send(WorkerMsg::Steer(text.to_owned()));
        }
    }

    pub fn admission_counts(&self) -> AdmissionCounts {
        self.slots.counts()
    }

    /// Alias matching the fabric's public `counts()` entry point.
    pub fn counts(&self) -> AdmissionCounts {
        self.admission_counts()
    }

    pub fn deps(&self) -> &Arc<RunDeps> {
        &self.deps
    }

    /// Drop bookkeeping for threads whose worker task has exited. A
    /// worker's `mpsc::Sender` stays registered in `workers` until this is
    /// called, so a long-running gateway should sweep periodically rather
    /// than let the map grow unbounded with dead entries.
    pub fn prune_idle_workers(&self) {
        self.workers.lock().retain(|_, sender| !sender.is_closed());
    }

    fn worker_for(&self, thread_key: &str) -> tokio::sync::mpsc::UnboundedSender<WorkerMsg> {
        let mut workers = self.workers.lock();
        if let Some(sender) = workers.get(thread_key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }
        let sender = thread_worker::spawn(
            thread_key.to_owned(),
            self.deps.clone(),
            self.slots.clone(),
            self.deps.config.queue.clone(),
        );
        workers.insert(thread_key.to_owned(), sender.clone());
        sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::store::MemoryStore;
    use aw_domain::session::{ChatState, ResumeToken};
    use aw_engine::EchoEngine;
    use std::time::Duration;

    fn scheduler() -> Arc<Scheduler> {
        let mut registry = EngineRegistry::new("echo");
        registry.register(Arc::new(EchoEngine::new("echo")));
        Scheduler::new(Arc::new(registry), MemoryStore::new(), Bus::new(), Arc::new(Config::default()))
    }

    #[test]
    fn thread_key_defaults_to_session_key_with_no_resume() {
        let job = Job::new("agent:a:main", "default", "hi", "telegram");
        assert_eq!(derive_thread_key(&job), "agent:a:main");
    }

    #[test]
    fn thread_key_follows_resume_token_value() {
        let mut job = Job::new("agent:a:main", "default", "hi", "telegram");
        job.resume = Some(ResumeToken { engine_id: "echo".into(), value: "sticky-123".into() });
        assert_eq!(derive_thread_key(&job), "sticky-123");
    }

    #[test]
    fn auto_resume_fills_in_resume_token_from_chat_state() {
        let store = MemoryStore::new();
        let config = Config::default();
        store
            .put_chat_state(ChatState::new(
                "agent:a:main",
                "echo",
                Some(ResumeToken { engine_id: "echo".into(), value: "resume-1".into() }),
            ))
            .unwrap();

        let mut job = Job::new("agent:a:main", "default", "hi", "telegram");
        apply_auto_resume(&config, store.as_ref(), &mut job);
        assert_eq!(job.resume.unwrap().value, "resume-1");
        assert_eq!(job.engine_id.unwrap(), "echo");
    }

    #[test]
    fn auto_resume_skipped_when_disabled_on_job() {
        let store = MemoryStore::new();
        let config = Config::default();
        store.put_chat_state(ChatState::new("agent:a:main", "echo", None)).unwrap();

        let mut job = Job::new("agent:a:main", "default", "hi", "telegram");
        job.meta.insert("disable_auto_resume".into(), serde_json::json!(true));
        apply_auto_resume(&config, store.as_ref(), &mut job);
        assert!(job.resume.is_none());
    }

    #[tokio::test]
    async fn submit_routes_through_a_worker_and_records_completion() {
        let scheduler = scheduler();
        let job = Job::new("agent:a:main", "default", "hello", "telegram");
        scheduler.submit(job);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.admission_counts().completed_today, 1);
    }

    #[test]
    fn cascade_child_is_registered_under_its_parent_session() {
        let scheduler = scheduler();
        let mut child = Job::new("agent:a:sub1", "default", "hi", "internal");
        child.lane = aw_domain::job::Lane::Subagent;
        child.meta.insert("parent_session_key".into(), serde_json::json!("agent:a:main"));
        scheduler.submit(child);

        assert_eq!(scheduler.cascade_children.lock().get("agent:a:main").map(Vec::len), Some(1));
    }

    #[test]
    fn cancel_by_session_clears_cascade_registration() {
        let scheduler = scheduler();
        let mut child = Job::new("agent:a:sub1", "default", "hi", "internal");
        child.meta.insert("parent_session_key".into(), serde_json::json!("agent:a:main"));
        scheduler.submit(child);

        scheduler.cancel_by_session("agent:a:main", "test");
        assert!(scheduler.cascade_children.lock().get("agent:a:main").is_none());
    }

    #[tokio::test]
    async fn cancel_by_run_id_looks_up_the_routed_thread() {
        let scheduler = scheduler();
        let job = Job::new("agent:a:main", "default", "hi", "telegram");
        let run_id = job.run_id;
        scheduler.submit(job);

        assert_eq!(scheduler.run_threads.lock().get(&run_id), Some(&"agent:a:main".to_owned()));
        scheduler.cancel_by_run_id(run_id, "test");
    }

    #[tokio::test]
    async fn a_second_submit_after_the_worker_goes_idle_spawns_a_fresh_one() {
        let mut registry = EngineRegistry::new("echo");
        registry.register(Arc::new(EchoEngine::new("echo")));
        let mut config = Config::default();
        config.queue.worker_idle_ms = 20;
        let scheduler = Scheduler::new(Arc::new(registry), MemoryStore::new(), Bus::new(), Arc::new(config));

        let job = Job::new("agent:a:main", "default", "hello", "telegram");
        scheduler.submit(job);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.admission_counts().completed_today, 1);

        // The worker should have terminated by now (idle 20ms grace, well
        // past); its sender is stale but `worker_for` notices via
        // `is_closed()` and transparently respawns on the next submit.
        let second = Job::new("agent:a:main", "default", "hello again", "telegram");
        scheduler.submit(second);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.admission_counts().completed_today, 2);
    }

    #[test]
    fn prune_idle_workers_drops_closed_senders() {
        let scheduler = scheduler();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        scheduler.workers.lock().insert("dead-thread".to_owned(), tx);
        assert_eq!(scheduler.workers.lock().len(), 1);

        scheduler.prune_idle_workers();
        assert!(scheduler.workers.lock().is_empty());
    }
}
