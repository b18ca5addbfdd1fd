use serde::Serialize;

/// Structured trace events emitted across the gateway fabric. Each variant
/// mirrors a state transition called out in the component design so that a
/// log pipeline can reconstruct a run's history without parsing prose.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionResolved {
        session_key: String,
        is_new: bool,
    },
    SessionReset {
        session_key: String,
        old_session_id: String,
        new_session_id: String,
        reason: String,
    },
    RunStarted {
        run_id: uuid::Uuid,
        session_key: String,
        engine_id: String,
    },
    RunCompleted {
        run_id: uuid::Uuid,
        session_key: String,
        ok: bool,
        error: Option<String>,
        duration_ms: u64,
    },
    LockAcquired {
        key: String,
        waited_ms: u64,
    },
    LockTimedOut {
        key: String,
        waited_ms: u64,
    },
    LockStaleReaped {
        key: String,
        held_ms: u64,
    },
    SlotGranted {
        thread_key: String,
        in_flight: u32,
    },
    SlotReleased {
        thread_key: String,
        in_flight: u32,
    },
    QueueModeApplied {
        session_key: String,
        mode: String,
        outcome: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "aw_event");
    }
}
