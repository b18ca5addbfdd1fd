use async_trait::async_trait;
use aw_domain::error::Result;
use aw_domain::job::Job;
use aw_domain::run::EngineEvent;
use aw_domain::session::ResumeToken;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One end of the channel an `Engine` pushes events into. A Run owns the
/// receiver; the engine (or its adapter task) owns the sender.
pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

/// Handle a Run uses to cancel or steer an in-flight engine invocation.
/// Opaque to everything except the engine that produced it.
pub trait CancelHandle: Send + Sync {
    /// Request cooperative cancellation with a human-readable reason.
    fn cancel(&self, reason: &str);

    /// Has cancellation already been requested?
    fn is_cancelled(&self) -> bool;
}

/// A trivial `CancelHandle` backed by an atomic flag, for engines with no
/// richer cancellation primitive of their own.
#[derive(Default)]
pub struct FlagCancelHandle {
    flag: std::sync::atomic::AtomicBool,
}

impl CancelHandle for FlagCancelHandle {
    fn cancel(&self, _reason: &str) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Result of starting a run: the Run only needs a cancel handle back, since
/// it already owns the receiving end of the event sink it handed to the
/// engine.
pub struct StartedRun {
    pub cancel: Arc<dyn CancelHandle>,
}

/// Outcome of a steer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerOutcome {
    Ok,
    Rejected,
}

/// Abstraction over an AI backend capable of producing events for one run.
/// An engine owns its subprocess or in-process session; the Run owns the
/// engine for the lifetime of one job. Implementations must push events in
/// the order `Started -> [Delta | ActionEvent]* -> Completed` and must
/// eventually push exactly one `Completed`, even on internal failure.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable identifier used in job routing, resume tokens, and config
    /// (e.g. `"lemon"`, `"claude"`).
    fn id(&self) -> &str;

    /// Start executing `job`, pushing events into `sink` as they occur.
    /// Returns immediately with a handle the Run can use to cancel later;
    /// the engine drives the rest of the run on its own task(s).
    async fn start(&self, job: Job, sink: EventSink) -> Result<StartedRun>;

    /// Request cancellation of a run started with this engine.
    fn cancel(&self, cancel: &dyn CancelHandle, reason: &str) {
        cancel.cancel(reason);
    }

    /// Whether this engine supports mid-run steering (injecting new text
    /// into an already-running invocation without restarting it).
    fn supports_steer(&self) -> bool {
        false
    }

    /// Attempt to steer an in-flight run. Only called when
    /// `supports_steer()` is true.
    async fn steer(&self, _cancel: &dyn CancelHandle, _text: &str) -> Result<SteerOutcome> {
        Ok(SteerOutcome::Rejected)
    }

    /// Render a resume token into the engine-specific string an operator
    /// might see (e.g. in a `/resume` admin command).
    fn format_resume(&self, token: &ResumeToken) -> String {
        token.value.clone()
    }

    /// Extract a resume token from free text, if this engine embeds one in
    /// its completion text (most engines return it structurally instead and
    /// leave this as a no-op).
    fn extract_resume(&self, _text: &str) -> Option<ResumeToken> {
        None
    }
}
