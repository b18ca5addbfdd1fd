//! Per-session FIFO queue actor.
//!
//! One `ThreadWorker` owns the backlog for exactly one thread key and runs
//! at most one `Run` at a time, serialising everything else behind it. The
//! five `QueueMode`s control how a newly submitted job interacts with
//! whatever's already queued or in flight; they're resolved here rather
//! than at submission time because only the worker owns the current queue
//! and active-run state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;

use aw_domain::config::QueueConfig;
use aw_domain::job::{merge_collect, DropPolicy, Job, QueueMode};
use aw_domain::trace::TraceEvent;

use crate::runtime::run::{spawn_run, RunDeps, RunHandle, RunOutcome};
use crate::runtime::slot::SlotAllocator;

/// Messages a `Scheduler` (or admin surface) sends to a running worker.
pub enum WorkerMsg {
    Submit(Job),
    Cancel(String),
    Steer(String),
    Shutdown,
}

/// Spawn the worker task and return the handle used to send it messages.
/// The task exits (dropping its receiver) on `WorkerMsg::Shutdown` or once
/// every sender clone is dropped.
pub fn spawn(
    thread_key: String,
    deps: Arc<RunDeps>,
    slots: Arc<SlotAllocator>,
    queue_cfg: QueueConfig,
) -> mpsc::UnboundedSender<WorkerMsg> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_loop(thread_key, deps, slots, queue_cfg, rx));
    tx
}

async fn run_loop(
    thread_key: String,
    deps: Arc<RunDeps>,
    slots: Arc<SlotAllocator>,
    queue_cfg: QueueConfig,
    mut msg_rx: mpsc::UnboundedReceiver<WorkerMsg>,
) {
    let mut queue: VecDeque<Job> = VecDeque::new();
    let handle_slot: Arc<SyncMutex<Option<Arc<RunHandle>>>> = Arc::new(SyncMutex::new(None));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RunOutcome>();
    let mut active = false;
    let mut last_followup_at: Option<Instant> = None;
    let followup_debounce = Duration::from_millis(deps.config.lifecycle.followup_debounce_ms);
    let idle_timeout = Duration::from_millis(queue_cfg.worker_idle_ms);

    loop {
        // Only arm the idle timer while there's nothing to do; a worker
        // that's actively running or has a backlog never terminates.
        let idle_deadline = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle_deadline);

        tokio::select! {
            msg = msg_rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    WorkerMsg::Submit(job) => {
                        handle_submit(
                            job,
                            &mut queue,
                            &queue_cfg,
                            &handle_slot,
                            &thread_key,
                            active,
                            followup_debounce,
                            &mut last_followup_at,
                        )
                        .await;
                    }
                    WorkerMsg::Cancel(reason) => {
                        let handle = handle_slot.lock().clone();
                        if let Some(h) = handle {
                            h.cancel(&reason);
                        }
                    }
                    WorkerMsg::Steer(text) => {
                        let handle = handle_slot.lock().clone();
                        if let Some(h) = handle {
                            let _ = h.steer(&text).await;
                        }
                    }
                    WorkerMsg::Shutdown => break,
                }
            }
            Some(outcome) = done_rx.recv(), if active => {
                active = false;
                slots.record_completion();
                tracing::debug!(run_id = %outcome.run_id, ok = outcome.ok, thread_key = %thread_key, "run terminated");
            }
            _ = &mut idle_deadline, if !active && queue.is_empty() => {
                tracing::debug!(thread_key = %thread_key, "worker idle, terminating");
                break;
            }
        }

        if !active {
            if let Some(job) = queue.pop_front() {
                active = true;
                let deps = deps.clone();
                let slots = slots.clone();
                let thread_key = thread_key.clone();
                let handle_slot = handle_slot.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let slot = slots.request_slot(&thread_key).await;
                    spawn_run(deps, job, slot, handle_slot, done_tx);
                });
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_submit(
    job: Job,
    queue: &mut VecDeque<Job>,
    cfg: &QueueConfig,
    handle_slot: &Arc<SyncMutex<Option<Arc<RunHandle>>>>,
    thread_key: &str,
    active: bool,
    followup_debounce: Duration,
    last_followup_at: &mut Option<Instant>,
) {
    match job.queue_mode {
        QueueMode::Collect => push_collect(job, queue, cfg, thread_key, active),
        QueueMode::Followup => {
            if active && job.meta_bool("task_auto_followup") {
                // A job that asks to auto-follow-up an active run behaves
                // like steer_backlog: try to steer the live run directly,
                // falling back to the backlog if steering isn't supported.
                if !try_steer(&job, handle_slot).await {
                    push_collect(job, queue, cfg, thread_key, active);
                }
            } else {
                push_followup_debounced(job, queue, cfg, thread_key, followup_debounce, last_followup_at);
            }
        }
        QueueMode::Steer => {
            if !try_steer(&job, handle_slot).await {
                push_capped(job, queue, cfg, thread_key, "steer_fallback");
            }
        }
        QueueMode::SteerBacklog => {
            if !try_steer(&job, handle_slot).await {
                push_collect(job, queue, cfg, thread_key, active);
            }
        }
        QueueMode::Interrupt => {
            let handle = handle_slot.lock().clone();
            if let Some(h) = handle {
                h.cancel("interrupt");
            }
            let dropped = queue.len();
            queue.clear();
            queue.push_back(job);
            TraceEvent::QueueModeApplied {
                session_key: thread_key.to_owned(),
                mode: "interrupt".into(),
                outcome: format!("cancelled_active_dropped_{dropped}_queued"),
            }
            .emit();
        }
    }
}

async fn try_steer(job: &Job, handle_slot: &Arc<SyncMutex<Option<Arc<RunHandle>>>>) -> bool {
    let handle = handle_slot.lock().clone();
    match handle {
        Some(h) if h.supports_steer() => h.steer(&job.prompt).await,
        _ => false,
    }
}

/// `collect` only merges into the tail of the queue when the job sitting
/// there is itself a `collect` job and nothing is currently running; a
/// `collect` arriving while a run is active, or behind a non-`collect` job,
/// is just appended as its own distinct entry.
fn push_collect(job: Job, queue: &mut VecDeque<Job>, cfg: &QueueConfig, thread_key: &str, active: bool) {
    let can_merge = !active && queue.back().map(|last| last.queue_mode == QueueMode::Collect).unwrap_or(false);
    if can_merge {
        let last = queue.back_mut().expect("checked above");
        *last = merge_collect(last, &job);
        TraceEvent::QueueModeApplied {
            session_key: thread_key.to_owned(),
            mode: "collect".into(),
            outcome: "merged".into(),
        }
        .emit();
    } else {
        push_capped(job, queue, cfg, thread_key, "collect");
    }
}

/// `followup` mode merges into the most recently queued followup if it was
/// enqueued within `debounce` of now (bursty retries/edits collapse into one
/// turn), otherwise it queues normally, capped like any other mode.
fn push_followup_debounced(
    job: Job,
    queue: &mut VecDeque<Job>,
    cfg: &QueueConfig,
    thread_key: &str,
    debounce: Duration,
    last_followup_at: &mut Option<Instant>,
) {
    let now = Instant::now();
    let within_window = last_followup_at.map(|t| now.duration_since(t) <= debounce).unwrap_or(false);
    if within_window {
        if let Some(last) = queue.back_mut() {
            *last = merge_collect(last, &job);
            *last_followup_at = Some(now);
            TraceEvent::QueueModeApplied {
                session_key: thread_key.to_owned(),
                mode: "followup".into(),
                outcome: "debounced_merge".into(),
            }
            .emit();
            return;
        }
    }
    push_capped(job, queue, cfg, thread_key, "followup");
    *last_followup_at = Some(now);
}

fn push_capped(job: Job, queue: &mut VecDeque<Job>, cfg: &QueueConfig, thread_key: &str, mode: &str) {
    if let Some(cap) = cfg.cap {
        if queue.len() >= cap {
            match cfg.drop {
                DropPolicy::Oldest => {
                    queue.pop_front();
                }
                DropPolicy::Newest => {
                    TraceEvent::QueueModeApplied {
                        session_key: thread_key.to_owned(),
                        mode: mode.to_owned(),
                        outcome: "dropped_newest".into(),
                    }
                    .emit();
                    return;
                }
            }
        }
    }
    queue.push_back(job);
    TraceEvent::QueueModeApplied {
        session_key: thread_key.to_owned(),
        mode: mode.to_owned(),
        outcome: "enqueued".into(),
    }
    .emit();
}
