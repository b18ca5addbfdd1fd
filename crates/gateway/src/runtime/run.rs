//! Per-run actor: owns one `Engine` invocation end to end, from lock
//! acquisition through the completion sequence.
//!
//! Spawned by a `ThreadWorker` once a concurrency slot has been granted.
//! Failure anywhere in this path (lock timeout, unknown engine, a panic
//! inside the event loop) must still release the engine lock and the
//! concurrency slot — a Run never gets to leak either, which is why both
//! are owned as RAII guards for the whole lifetime of this function rather
//! than threaded through as plain values.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use uuid::Uuid;

use aw_domain::config::Config;
use aw_domain::job::Job;
use aw_domain::run::{EngineEvent, Run, RunState, Usage};
use aw_domain::session::{ChatState, PendingCompaction, ResumeToken};
use aw_domain::trace::TraceEvent;
use aw_engine::{CancelHandle, Engine, EngineRegistry, SteerOutcome};

use crate::runtime::bus::{Bus, BusEvent};
use crate::runtime::engine_lock::EngineLock;
use crate::runtime::slot::SlotHandle;
use crate::runtime::store::{RunHistoryEntry, Store};

/// Shared dependencies every `Run` needs; cloned cheaply (all `Arc`)
/// per-spawn from the `Scheduler`/`ThreadWorker`.
pub struct RunDeps {
    pub engines: Arc<EngineRegistry>,
    pub engine_lock: Arc<EngineLock>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<Bus>,
    pub config: Arc<Config>,
}

/// Handle the owning `ThreadWorker` keeps for the currently active run, so
/// `cancel`/`steer` queue-mode handling can reach it without owning the
/// run's task directly.
pub struct RunHandle {
    run_id: Uuid,
    engine: Arc<dyn Engine>,
    cancel: Arc<dyn CancelHandle>,
    cancel_reason: Arc<SyncMutex<Option<String>>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancel(&self, reason: &str) {
        *self.cancel_reason.lock() = Some(reason.to_owned());
        self.engine.cancel(self.cancel.as_ref(), reason);
    }

    pub fn supports_steer(&self) -> bool {
        self.engine.supports_steer()
    }

    pub async fn steer(&self, text: &str) -> bool {
        if !self.engine.supports_steer() {
            return false;
        }
        matches!(self.engine.steer(self.cancel.as_ref(), text).await, Ok(SteerOutcome::Ok))
    }
}

/// Outcome handed back to the owning `ThreadWorker` once a run terminates.
pub struct RunOutcome {
    pub run_id: Uuid,
    pub ok: bool,
}

const OVERFLOW_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "context window",
    "too many tokens",
    "context_overflow",
];

fn is_context_overflow(error: &str) -> bool {
    let lower = error.to_lowercase();
    OVERFLOW_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_zero_answer_assistant_error(answer: &Option<String>, error: &Option<String>) -> bool {
    let empty_answer = answer.as_deref().map(str::is_empty).unwrap_or(true);
    let is_assistant_error = error
        .as_deref()
        .map(|e| e.to_lowercase().contains("assistant_error"))
        .unwrap_or(false);
    empty_answer && is_assistant_error
}

/// Spawn a run. Returns immediately with a [`tokio::task::JoinHandle`]
/// resolving to the final [`RunOutcome`], and a slot that's filled in with
/// a [`RunHandle`] once `Engine::start` succeeds (left `None` if the run
/// fails before that point, e.g. a lock timeout or an unknown engine id).
pub fn spawn_run(
    deps: Arc<RunDeps>,
    job: Job,
    slot: SlotHandle,
    handle_slot: Arc<SyncMutex<Option<Arc<RunHandle>>>>,
    on_terminate: mpsc::UnboundedSender<RunOutcome>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let run_id = job.run_id;
        let session_key = job.session_key.clone();
        let ok = run_to_completion(deps, job, handle_slot).await;
        drop(slot);
        let _ = on_terminate.send(RunOutcome { run_id, ok });
        tracing::debug!(run_id = %run_id, session_key = %session_key, "run task finished");
    })
}

async fn run_to_completion(deps: Arc<RunDeps>, job: Job, handle_slot: Arc<SyncMutex<Option<Arc<RunHandle>>>>) -> bool {
    let run_id = job.run_id;
    let session_key = job.session_key.clone();
    let mut run = Run::new(job.clone());

    let lock_key = session_key.clone();
    let timeout = Duration::from_millis(deps.config.scheduler.engine_lock_timeout_ms);
    let lock_guard = if deps.config.scheduler.require_engine_lock {
        match deps.engine_lock.acquire(&lock_key, timeout).await {
            Ok(g) => Some(g),
            Err(_) => {
                finish_with_synthetic_failure(&deps, &mut run, "lock_timeout");
                return false;
            }
        }
    } else {
        None
    };

    let engine = match deps.engines.resolve(job.engine_id.as_deref()) {
        Ok(e) => e,
        Err(e) => {
            finish_with_synthetic_failure(&deps, &mut run, &format!("unknown_engine: {e}"));
            return false;
        }
    };

    run.transition(RunState::Running);
    TraceEvent::RunStarted { run_id, session_key: session_key.clone(), engine_id: engine.id().to_owned() }.emit();
    deps.bus.publish(&Bus::run_topic(run_id), BusEvent::run_started(run_id));
    deps.bus.publish(&Bus::session_topic(&session_key), BusEvent::run_started(run_id));

    let mut attempt_job = job.clone();
    let mut retried = false;

    loop {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = match engine.start(attempt_job.clone(), tx).await {
            Ok(s) => s,
            Err(e) => {
                finish_with_synthetic_failure(&deps, &mut run, &format!("engine_start_failed: {e}"));
                return false;
            }
        };

        let cancel_reason = Arc::new(SyncMutex::new(None));
        let handle = Arc::new(RunHandle {
            run_id,
            engine: engine.clone(),
            cancel: started.cancel.clone(),
            cancel_reason: cancel_reason.clone(),
        });
        *handle_slot.lock() = Some(handle.clone());

        let idle_watchdog = Duration::from_millis(deps.config.lifecycle.idle_watchdog_ms);
        let idle_confirm = Duration::from_millis(deps.config.lifecycle.idle_watchdog_confirm_ms);
        let death_grace = Duration::from_millis(deps.config.lifecycle.engine_death_grace_ms);
        let mut completed: Option<EngineEvent> = None;

        // Once the idle watchdog elapses with no activity we don't force a
        // cancel immediately: a keepalive prompt goes out on the bus and we
        // give the run one more, shorter window to either resume activity
        // or actually terminate. Any activity (including an explicit cancel
        // arriving through `RunHandle::cancel`) clears this and goes back to
        // waiting the full idle window; only a second silent timeout forces
        // the synthetic failure.
        let mut awaiting_idle_confirm = false;

        loop {
            let wait = if awaiting_idle_confirm { idle_confirm } else { idle_watchdog };
            let recv = tokio::time::timeout_at(TokioInstant::now() + wait, rx.recv()).await;
            match recv {
                Ok(Some(EngineEvent::Started { resume, .. })) => {
                    awaiting_idle_confirm = false;
                    run.resume = resume;
                }
                Ok(Some(EngineEvent::Delta { text, .. })) => {
                    awaiting_idle_confirm = false;
                    run.saw_delta = true;
                    let seq = run.next_seq();
                    deps.store.set_progress(run_id, seq);
                    let event = EngineEvent::Delta { seq, text };
                    deps.bus.publish(&Bus::run_topic(run_id), BusEvent::engine(run_id, "delta", event.clone()));
                    deps.bus.publish(&Bus::session_topic(&session_key), BusEvent::engine(run_id, "delta", event));
                }
                Ok(Some(EngineEvent::ActionEvent { action, phase, ok })) => {
                    awaiting_idle_confirm = false;
                    run.last_activity_at = chrono::Utc::now();
                    let event = EngineEvent::ActionEvent { action, phase, ok };
                    deps.bus.publish(&Bus::run_topic(run_id), BusEvent::engine(run_id, "engine_action", event.clone()));
                    deps.bus.publish(&Bus::session_topic(&session_key), BusEvent::engine(run_id, "engine_action", event));
                }
                Ok(Some(c @ EngineEvent::Completed { .. })) => {
                    completed = Some(c);
                    break;
                }
                Ok(None) => {
                    // Sender dropped without a terminal event. Give the
                    // engine a brief grace window (it may still be flushing
                    // a final Completed through a buffered channel) before
                    // treating this as a lost engine.
                    tokio::time::sleep(death_grace).await;
                    completed = Some(EngineEvent::Completed {
                        ok: false,
                        answer: None,
                        error: Some("engine_lost".to_owned()),
                        resume: run.resume.clone(),
                        usage: None,
                    });
                    break;
                }
                Err(_) if awaiting_idle_confirm => {
                    // No activity during the confirm window either: force it.
                    completed = Some(EngineEvent::Completed {
                        ok: false,
                        answer: None,
                        error: Some("idle_watchdog_timeout".to_owned()),
                        resume: run.resume.clone(),
                        usage: None,
                    });
                    break;
                }
                Err(_) => {
                    // First idle timeout. Give an interactive channel a
                    // chance to ask "Keep Waiting?" before we force a
                    // cancel; a channel that can't render the prompt just
                    // ignores the event and the confirm window elapses on
                    // its own.
                    deps.bus.publish(&Bus::run_topic(run_id), BusEvent::idle_keepalive_prompt(run_id));
                    deps.bus.publish(&Bus::session_topic(&session_key), BusEvent::idle_keepalive_prompt(run_id));
                    awaiting_idle_confirm = true;
                }
            }
        }

        *handle_slot.lock() = None;

        let EngineEvent::Completed { ok, answer, error, resume, usage } = completed.unwrap() else {
            unreachable!("loop only breaks with a Completed event")
        };

        let was_cancelled = cancel_reason.lock().is_some();
        if !retried && !was_cancelled && is_zero_answer_assistant_error(&answer, &error) {
            retried = true;
            attempt_job = job.clone();
            continue;
        }

        return finish_completion(&deps, &mut run, lock_guard, ok, answer, error, resume, usage);
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_completion(
    deps: &Arc<RunDeps>,
    run: &mut Run,
    lock_guard: Option<crate::runtime::engine_lock::LockGuard>,
    ok: bool,
    answer: Option<String>,
    error: Option<String>,
    resume: Option<ResumeToken>,
    usage: Option<Usage>,
) -> bool {
    let run_id = run.run_id;
    let session_key = run.session_key.clone();

    let mut pending_overflow = false;
    let mut final_resume = resume;

    if let Some(err) = &error {
        if is_context_overflow(err) {
            pending_overflow = true;
            final_resume = None;
        }
    }

    if !pending_overflow {
        if let Some(u) = &usage {
            if let Some(window) = u.context_window {
                if window > 0 && (u.total_tokens as f64 / window as f64) >= 0.9 {
                    let _ = deps.store.put_pending_compaction(PendingCompaction {
                        session_key: session_key.clone(),
                        reason: "usage_ratio".to_owned(),
                        ts: chrono::Utc::now(),
                    });
                }
            }
        }
    } else {
        let _ = deps.store.put_pending_compaction(PendingCompaction {
            session_key: session_key.clone(),
            reason: "context_overflow".to_owned(),
            ts: chrono::Utc::now(),
        });
    }

    if ok {
        if let Some(resume) = &final_resume {
            let engine_id = resume.engine_id.clone();
            let _ = deps.store.put_chat_state(ChatState::new(session_key.clone(), engine_id, Some(resume.clone())));
        }
    }
    if pending_overflow {
        deps.store.delete_chat_state(&session_key);
    }

    run.answer = answer;
    run.error = error.clone();
    run.resume = final_resume;
    run.usage = usage;
    run.transition(if ok { RunState::Completed } else { RunState::Error });

    let _ = deps.store.append_run_history(RunHistoryEntry {
        run_id,
        session_key: session_key.clone(),
        ok,
        error: error.clone(),
        ended_at: chrono::Utc::now(),
    });
    let _ = deps.store.put_run(run.clone());

    TraceEvent::RunCompleted {
        run_id,
        session_key: session_key.clone(),
        ok,
        error,
        duration_ms: run.duration_ms().unwrap_or(0) as u64,
    }
    .emit();
    deps.bus.publish(&Bus::run_topic(run_id), BusEvent::run_completed(run_id, run.resume.clone()));
    deps.bus.publish(&Bus::session_topic(&session_key), BusEvent::run_completed(run_id, run.resume.clone()));

    if let Some(pid) = run.job.notify_pid() {
        tracing::info!(run_id = %run_id, notify_pid = %pid, "run completion notification");
    }

    drop(lock_guard);
    ok
}

fn finish_with_synthetic_failure(deps: &Arc<RunDeps>, run: &mut Run, reason: &str) {
    run.transition(RunState::Error);
    let run_id = run.run_id;
    let session_key = run.session_key.clone();
    run.error = Some(reason.to_owned());

    let _ = deps.store.append_run_history(RunHistoryEntry {
        run_id,
        session_key: session_key.clone(),
        ok: false,
        error: Some(reason.to_owned()),
        ended_at: chrono::Utc::now(),
    });
    let _ = deps.store.put_run(run.clone());

    TraceEvent::RunCompleted {
        run_id,
        session_key: session_key.clone(),
        ok: false,
        error: Some(reason.to_owned()),
        duration_ms: run.duration_ms().unwrap_or(0) as u64,
    }
    .emit();
    deps.bus.publish(&Bus::run_topic(run_id), BusEvent::run_completed(run_id, None));
    deps.bus.publish(&Bus::session_topic(&session_key), BusEvent::run_completed(run_id, None));
}
