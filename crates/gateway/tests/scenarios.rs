//! End-to-end scenarios exercising `aw-gateway` as a whole: an
//! `InboundMessage`/`Job` goes in through `Router`/`Scheduler::submit`, an
//! `EchoEngine` (or a small purpose-built test engine) drives it to
//! completion, and the assertions look at what landed in the `Store` and
//! on the `Bus` — the same seam a real channel adapter and a real engine
//! meet at.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use aw_domain::config::Config;
use aw_domain::error::Result;
use aw_domain::job::{Job, QueueMode};
use aw_domain::run::EngineEvent;
use aw_engine::{CancelHandle, Engine, EngineRegistry, EventSink, FlagCancelHandle, StartedRun};
use aw_gateway::router::{InboundMessage, InboundPeer, InboundSender, InboundText, Router};
use aw_gateway::runtime::bus::{Bus, BusEvent};
use aw_gateway::runtime::run::{spawn_run, RunDeps, RunOutcome};
use aw_gateway::runtime::scheduler::Scheduler;
use aw_gateway::runtime::slot::SlotAllocator;
use aw_gateway::runtime::store::{MemoryStore, Store};

fn dm(channel_id: &str, account_id: &str, peer_id: &str, text: &str) -> InboundMessage {
    InboundMessage {
        channel_id: channel_id.into(),
        account_id: account_id.into(),
        peer: InboundPeer { kind: aw_domain::session::PeerKind::Dm, id: peer_id.into(), thread_id: None },
        sender: Some(InboundSender { id: peer_id.into(), username: None, display_name: None }),
        message: InboundText { id: None, text: text.into(), timestamp: None, reply_to_id: None },
        raw: serde_json::Value::Null,
        meta: Default::default(),
    }
}

async fn wait_for_run(store: &Arc<dyn Store>, run_id: uuid::Uuid) -> aw_domain::run::Run {
    for _ in 0..200 {
        if let Some(run) = store.get_run(run_id) {
            if run.state.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached a terminal state");
}

/// S1 — happy path, new session. A DM with no resume/engine override routes
/// through a freshly spawned thread, completes once, and leaves durable
/// chat state behind for the next turn.
#[tokio::test]
async fn s1_happy_path_new_session() {
    let store = MemoryStore::new() as Arc<dyn Store>;
    let mut registry = EngineRegistry::new("echo");
    registry.register(Arc::new(aw_engine::EchoEngine::new("echo")));
    let engines = Arc::new(registry);
    let config = Arc::new(Config::default());
    let bus = Bus::new();
    let scheduler = Scheduler::new(engines.clone(), store.clone(), bus.clone(), config.clone());
    let router = Router::new(scheduler.clone(), store.clone(), config, engines);

    let mut run_completed_rx = bus.subscribe(&Bus::session_topic("agent:default:telegram:a1:dm:99"));

    let outcome = router.handle_inbound(dm("telegram", "a1", "99", "hello"));
    assert_eq!(outcome.session_key, "agent:default:telegram:a1:dm:99");

    let run = wait_for_run(&store, outcome.run_id).await;
    assert!(run.answer.unwrap_or_default().contains("hello"));

    let chat = store.get_chat_state(&outcome.session_key).expect("chat state persisted after a completed run");
    assert_eq!(chat.engine_id, "echo");
    assert!(chat.resume.is_some());

    assert_eq!(scheduler.counts().completed_today, 1);

    let mut saw_run_completed = false;
    while let Ok(event) = run_completed_rx.try_recv() {
        if event.tag == "run_completed" && event.run_id == outcome.run_id {
            saw_run_completed = true;
        }
    }
    assert!(saw_run_completed, "expected exactly one run_completed event on the session topic");
}

/// S2 — sticky engine override. A phrase naming a registered engine wins
/// for this turn and is what the next turn auto-resumes onto.
#[tokio::test]
async fn s2_sticky_engine_override_is_remembered() {
    let store = MemoryStore::new() as Arc<dyn Store>;
    let mut registry = EngineRegistry::new("echo");
    registry.register(Arc::new(aw_engine::EchoEngine::new("echo")));
    registry.register(Arc::new(aw_engine::EchoEngine::new("codex")));
    let engines = Arc::new(registry);
    let config = Arc::new(Config::default());
    let scheduler = Scheduler::new(engines.clone(), store.clone(), Bus::new(), config.clone());
    let router = Router::new(scheduler.clone(), store.clone(), config, engines);

    let first = router.handle_inbound(dm("telegram", "a1", "99", "use codex to refactor foo.go"));
    let run = wait_for_run(&store, first.run_id).await;
    assert_eq!(run.job.engine_id.as_deref(), Some("codex"));

    let chat = store.get_chat_state(&first.session_key).unwrap();
    assert_eq!(chat.engine_id, "codex");

    // A follow-up with no explicit engine auto-resumes onto codex.
    let second = router.handle_inbound(dm("telegram", "a1", "99", "continue"));
    let run2 = wait_for_run(&store, second.run_id).await;
    assert_eq!(run2.job.engine_id.as_deref(), Some("codex"));
}

/// S4 — slot saturation. With `max_concurrent_runs = 1`, two jobs on
/// different session keys never run concurrently, and both eventually
/// complete with the admission count back at zero in-flight.
#[tokio::test]
async fn s4_slot_saturation_serializes_distinct_sessions() {
    let store = MemoryStore::new() as Arc<dyn Store>;
    let mut registry = EngineRegistry::new("echo");
    registry.register(Arc::new(aw_engine::EchoEngine::new("echo")));
    let engines = Arc::new(registry);
    let mut config = Config::default();
    config.scheduler.max_concurrent_runs = 1;
    let config = Arc::new(config);
    let scheduler = Scheduler::new(engines, store.clone(), Bus::new(), config);

    let job_a = Job::new("agent:a:main", "default", "first", "telegram");
    let job_b = Job::new("agent:b:main", "default", "second", "telegram");
    let run_a = job_a.run_id;
    let run_b = job_b.run_id;

    scheduler.submit(job_a);
    scheduler.submit(job_b);

    let a = wait_for_run(&store, run_a).await;
    let b = wait_for_run(&store, run_b).await;
    assert!(a.state.is_terminal() && b.state.is_terminal());
    assert_eq!(scheduler.counts().active, 0);
    assert_eq!(scheduler.counts().completed_today, 2);
}

struct NeverCompletesEngine {
    id: String,
}

#[async_trait]
impl Engine for NeverCompletesEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, _job: Job, sink: EventSink) -> Result<StartedRun> {
        let cancel: Arc<dyn CancelHandle> = Arc::new(FlagCancelHandle::default());
        // Emit Started, then drop the sink without ever sending Completed —
        // simulates an engine subprocess dying mid-run.
        let _ = sink.send(EngineEvent::Started { engine: self.id.clone(), resume: None, title: None });
        drop(sink);
        Ok(StartedRun { cancel })
    }
}

/// S5 — engine-lost synthesis. When an engine's event sink closes without a
/// terminal `Completed`, the run actor synthesizes one after the configured
/// grace period rather than hanging forever.
#[tokio::test]
async fn s5_engine_lost_synthesizes_a_failed_completion() {
    let mut registry = EngineRegistry::new("flaky");
    registry.register(Arc::new(NeverCompletesEngine { id: "flaky".into() }));
    let deps = Arc::new(RunDeps {
        engines: Arc::new(registry),
        engine_lock: aw_gateway::runtime::engine_lock::EngineLock::new(true, 120_000),
        store: MemoryStore::new() as Arc<dyn Store>,
        bus: Bus::new(),
        config: Arc::new(Config::default()),
    });

    let mut job = Job::new("agent:a:main", "default", "hi", "telegram");
    job.engine_id = Some("flaky".into());
    let slot_alloc = SlotAllocator::new(1, 30_000);
    let slot = slot_alloc.request_slot("agent:a:main").await;
    let handle_slot = Arc::new(parking_lot::Mutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel::<RunOutcome>();

    let started = std::time::Instant::now();
    let _ = spawn_run(deps, job, slot, handle_slot, tx).await;
    let outcome = rx.recv().await.unwrap();
    let elapsed = started.elapsed();

    assert!(!outcome.ok);
    // death grace defaults to 200ms; give generous slack for CI jitter.
    assert!(elapsed < Duration::from_secs(2), "engine-lost synthesis took {elapsed:?}, expected well under the watchdog");
    assert_eq!(slot_alloc.counts().active, 0);
}

struct ContextOverflowEngine {
    id: String,
}

#[async_trait]
impl Engine for ContextOverflowEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, _job: Job, sink: EventSink) -> Result<StartedRun> {
        let cancel: Arc<dyn CancelHandle> = Arc::new(FlagCancelHandle::default());
        let _ = sink.send(EngineEvent::Started { engine: self.id.clone(), resume: None, title: None });
        let _ = sink.send(EngineEvent::Completed {
            ok: false,
            answer: None,
            error: Some("maximum context length exceeded".into()),
            resume: None,
            usage: None,
        });
        Ok(StartedRun { cancel })
    }
}

/// S6 — context-overflow clears resume. A completion whose error names a
/// context-length overflow drops the session's `ChatState` and leaves a
/// fresh `PendingCompaction` marker for the router's next submit to find.
#[tokio::test]
async fn s6_context_overflow_clears_resume_and_marks_pending_compaction() {
    let store = MemoryStore::new() as Arc<dyn Store>;
    let mut registry = EngineRegistry::new("overflow");
    registry.register(Arc::new(ContextOverflowEngine { id: "overflow".into() }));
    let deps = Arc::new(RunDeps {
        engines: Arc::new(registry),
        engine_lock: aw_gateway::runtime::engine_lock::EngineLock::new(true, 120_000),
        store: store.clone(),
        bus: Bus::new(),
        config: Arc::new(Config::default()),
    });

    store
        .put_chat_state(aw_domain::session::ChatState::new(
            "agent:a:main",
            "overflow",
            Some(aw_domain::session::ResumeToken { engine_id: "overflow".into(), value: "prior".into() }),
        ))
        .unwrap();

    let mut job = Job::new("agent:a:main", "default", "keep going", "telegram");
    job.engine_id = Some("overflow".into());
    let slot_alloc = SlotAllocator::new(1, 30_000);
    let slot = slot_alloc.request_slot("agent:a:main").await;
    let handle_slot = Arc::new(parking_lot::Mutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel::<RunOutcome>();

    let _ = spawn_run(deps, job, slot, handle_slot, tx).await;
    let outcome = rx.recv().await.unwrap();
    assert!(!outcome.ok);

    assert!(store.get_chat_state("agent:a:main").is_none());
    let marker = store.get_pending_compaction("agent:a:main").expect("pending compaction recorded");
    assert!(marker.is_fresh(chrono::Utc::now()));
}

/// Boundary behaviour: `queue_mode: interrupt` with no active run on the
/// target thread behaves like `collect` — there's nothing to interrupt, so
/// the job just runs.
#[tokio::test]
async fn interrupt_with_no_active_run_behaves_like_collect() {
    let store = MemoryStore::new() as Arc<dyn Store>;
    let mut registry = EngineRegistry::new("echo");
    registry.register(Arc::new(aw_engine::EchoEngine::new("echo")));
    let engines = Arc::new(registry);
    let scheduler = Scheduler::new(engines, store.clone(), Bus::new(), Arc::new(Config::default()));

    let mut job = Job::new("agent:a:main", "default", "hi", "telegram");
    job.queue_mode = QueueMode::Interrupt;
    let run_id = job.run_id;
    scheduler.submit(job);

    let run = wait_for_run(&store, run_id).await;
    assert!(run.state.is_terminal());
}
