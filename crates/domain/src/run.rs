//! `Run` lifecycle record, action kinds, and coalescer state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::Job;
use crate::session::ResumeToken;

/// Monotonic lifecycle states for a `Run`. Only forward transitions are
/// valid; `RunStore` enforces this with `RunState::can_transition_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Error,
    Killed,
    Cancelled,
    Lost,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Error | RunState::Killed | RunState::Cancelled | RunState::Lost
        )
    }

    /// Transitions are monotonic: `Queued -> Running -> <terminal>`. A
    /// terminal state never transitions again.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match self {
            RunState::Queued => matches!(next, RunState::Running) || next.is_terminal(),
            RunState::Running => next.is_terminal(),
            terminal if terminal.is_terminal() => false,
            _ => true,
        }
    }
}

/// Whitelist of action kinds the `ToolStatusCoalescer` will surface.
/// Anything else (e.g. a bare note) is dropped at the coalescer boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Tool,
    Command,
    FileChange,
    WebSearch,
    Subagent,
}

impl ActionKind {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "tool" => Some(ActionKind::Tool),
            "command" => Some(ActionKind::Command),
            "file_change" => Some(ActionKind::FileChange),
            "web_search" => Some(ActionKind::WebSearch),
            "subagent" => Some(ActionKind::Subagent),
            _ => None,
        }
    }
}

/// One tool/command/etc. surfaced in the action status stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    /// Short result text attached to a `Completed` phase (e.g. a command's
    /// stdout tail); the status renderer truncates this to 140 chars.
    #[serde(default)]
    pub result: Option<String>,
}

/// Completion phase of an `ActionEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Started,
    Completed,
}

/// Aggregate token usage reported at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Total context window size for the model that produced this run, used
    /// for the preemptive-compaction ratio check.
    pub context_window: Option<u64>,
}

/// The durable lifecycle record for one run. `seq_counter` is the monotonic
/// counter a Run assigns to its own `Delta` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub session_key: String,
    pub job: Job,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub saw_delta: bool,
    pub seq_counter: u64,
    pub answer: Option<String>,
    pub error: Option<String>,
    pub resume: Option<ResumeToken>,
    pub usage: Option<Usage>,
}

impl Run {
    pub fn new(job: Job) -> Self {
        let now = Utc::now();
        Self {
            run_id: job.run_id,
            session_key: job.session_key.clone(),
            job,
            state: RunState::Queued,
            started_at: now,
            last_activity_at: now,
            ended_at: None,
            saw_delta: false,
            seq_counter: 0,
            answer: None,
            error: None,
            resume: None,
            usage: None,
        }
    }

    /// Assign the next monotonic `seq` for a `Delta` event.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.seq_counter;
        self.seq_counter += 1;
        self.last_activity_at = Utc::now();
        seq
    }

    /// Move to `next`, recording end time if terminal. Returns `false`
    /// (no-op) if the transition is not monotonic.
    pub fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at.map(|e| (e - self.started_at).num_milliseconds())
    }
}

/// Tagged engine events a `Run` receives from its `Engine::start` sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "started")]
    Started {
        engine: String,
        resume: Option<ResumeToken>,
        title: Option<String>,
    },
    #[serde(rename = "delta")]
    Delta { seq: u64, text: String },
    #[serde(rename = "action")]
    ActionEvent {
        action: Action,
        phase: ActionPhase,
        ok: Option<bool>,
    },
    #[serde(rename = "completed")]
    Completed {
        ok: bool,
        answer: Option<String>,
        error: Option<String>,
        resume: Option<ResumeToken>,
        usage: Option<Usage>,
    },
}

/// Per-`{session_key, channel_id}` buffering state for the stream and
/// tool-status coalescers.
#[derive(Debug, Clone, Default)]
pub struct CoalescerState {
    pub buffer: String,
    pub last_flush_ts: Option<DateTime<Utc>>,
    pub answer_msg_id: Option<String>,
    pub status_msg_id: Option<String>,
    pub known_actions: Vec<String>,
    pub last_rendered_text: Option<String>,
    /// Last tool-status block actually sent to the channel. A freshly
    /// rendered status identical to this is suppressed rather than
    /// re-edited.
    pub last_rendered_status: Option<String>,
    pub pending_acks: Vec<String>,
    /// Next `Delta.seq` this coalescer expects to append. Deltas below this
    /// are duplicates (ignored); deltas above it wait in `reorder_window`
    /// until the gap closes.
    pub next_seq: u64,
    /// Out-of-order deltas held until their predecessor arrives, keyed by
    /// `seq`. Bounded by `REORDER_WINDOW`; a delta that would grow the
    /// window past that is flushed through immediately rather than held
    /// indefinitely for a predecessor that may never show up.
    pub reorder_window: std::collections::BTreeMap<u64, String>,
}
