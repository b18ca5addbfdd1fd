//! `Job` — a request to run one prompt, and the queue-mode/lane enums that
//! shape how a `ThreadWorker` schedules it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::policy::ToolPolicy;
use crate::session::ResumeToken;

/// Controls how a newly enqueued job interacts with an active/queued job for
/// the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Collect,
    Followup,
    Steer,
    SteerBacklog,
    Interrupt,
}

impl Default for QueueMode {
    fn default() -> Self {
        QueueMode::Collect
    }
}

/// Which execution lane a job belongs to. `Subagent` runs are cascade-
/// cancelled with their parent `Main` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Main,
    Subagent,
    BackgroundExec,
}

impl Default for Lane {
    fn default() -> Self {
        Lane::Main
    }
}

/// Free-form per-job metadata map (`notify_pid`, `progress_msg_id`,
/// `disable_auto_resume`, channel-specific keys).
pub type JobMeta = HashMap<String, serde_json::Value>;

/// Request to run one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,
    pub session_key: String,
    pub agent_id: String,
    pub prompt: String,
    /// Channel tag identifying where this job originated (e.g. `"telegram"`,
    /// `"control_plane"`).
    pub origin: String,
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub resume: Option<ResumeToken>,
    #[serde(default)]
    pub tool_policy: Option<ToolPolicy>,
    #[serde(default)]
    pub queue_mode: QueueMode,
    #[serde(default)]
    pub lane: Lane,
    #[serde(default)]
    pub meta: JobMeta,
}

impl Job {
    pub fn new(session_key: impl Into<String>, agent_id: impl Into<String>, prompt: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session_key: session_key.into(),
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            origin: origin.into(),
            engine_id: None,
            model: None,
            cwd: None,
            resume: None,
            tool_policy: None,
            queue_mode: QueueMode::default(),
            lane: Lane::default(),
            meta: JobMeta::default(),
        }
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.meta.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn notify_pid(&self) -> Option<String> {
        self.meta.get("notify_pid").and_then(|v| v.as_str()).map(|s| s.to_string())
    }
}

/// Merge two consecutive `collect`-mode jobs: preserve the later message's
/// metadata/origin, retain the earlier text verbatim, joined by a newline.
pub fn merge_collect(earlier: &Job, later: &Job) -> Job {
    let mut merged = later.clone();
    merged.prompt = format!("{}\n{}", earlier.prompt, later.prompt);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_mode_is_collect() {
        assert_eq!(QueueMode::default(), QueueMode::Collect);
    }

    #[test]
    fn merge_collect_preserves_later_metadata_and_joins_text() {
        let mut earlier = Job::new("s1", "default", "first message", "telegram");
        earlier.meta.insert("x".into(), serde_json::json!(1));
        let mut later = Job::new("s1", "default", "second message", "telegram");
        later.meta.insert("y".into(), serde_json::json!(2));

        let merged = merge_collect(&earlier, &later);
        assert_eq!(merged.prompt, "first message\nsecond message");
        assert!(merged.meta.contains_key("y"));
        assert!(!merged.meta.contains_key("x"));
    }
}
