//! Root configuration, one struct per concern: each subsystem owns its
//! own struct with `#[serde(default)]` fields, and `Config::validate`
//! rolls them up into a flat list of issues the caller can act on.

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
    #[serde(default = "d_true")]
    pub auto_resume: bool,
    #[serde(default = "d_true")]
    pub require_engine_lock: bool,
    #[serde(default = "d_engine_lock_timeout_ms")]
    pub engine_lock_timeout_ms: u64,
    #[serde(default = "d_max_lock_age_ms")]
    pub max_lock_age_ms: u64,
    /// Waiter garbage-collection threshold for abandoned slot requests.
    #[serde(default = "d_slot_stale_ms")]
    pub slot_stale_ms: u64,
}

fn d_max_concurrent_runs() -> u32 {
    2
}
fn d_engine_lock_timeout_ms() -> u64 {
    60_000
}
fn d_max_lock_age_ms() -> u64 {
    120_000
}
fn d_slot_stale_ms() -> u64 {
    30_000
}
fn d_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: d_max_concurrent_runs(),
            auto_resume: true,
            require_engine_lock: true,
            engine_lock_timeout_ms: d_engine_lock_timeout_ms(),
            max_lock_age_ms: d_max_lock_age_ms(),
            slot_stale_ms: d_slot_stale_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// `None` means unlimited.
    #[serde(default)]
    pub cap: Option<usize>,
    #[serde(default = "d_drop_policy")]
    pub drop: DropPolicy,
    /// How long a `ThreadWorker` sits with an empty queue and no active run
    /// before it terminates. The Scheduler re-spawns a fresh worker on the
    /// next submit for that thread-key.
    #[serde(default = "d_worker_idle_ms")]
    pub worker_idle_ms: u64,
}

fn d_drop_policy() -> DropPolicy {
    DropPolicy::Oldest
}
fn d_worker_idle_ms() -> u64 {
    30_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { cap: None, drop: d_drop_policy(), worker_idle_ms: d_worker_idle_ms() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coalescing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescingConfig {
    #[serde(default = "d_min_chars")]
    pub min_chars: usize,
    #[serde(default = "d_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "d_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Hard cap on buffered edit-capable text before a forced flush.
    #[serde(default = "d_max_buffer_chars")]
    pub max_buffer_chars: usize,
    /// Capacity of the tool-status surface before oldest entries drop.
    #[serde(default = "d_max_status_entries")]
    pub max_status_entries: usize,
}

fn d_min_chars() -> usize {
    48
}
fn d_idle_ms() -> u64 {
    400
}
fn d_max_latency_ms() -> u64 {
    1_200
}
fn d_max_buffer_chars() -> usize {
    100_000
}
fn d_max_status_entries() -> usize {
    40
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            min_chars: d_min_chars(),
            idle_ms: d_idle_ms(),
            max_latency_ms: d_max_latency_ms(),
            max_buffer_chars: d_max_buffer_chars(),
            max_status_entries: d_max_status_entries(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "d_followup_debounce_ms")]
    pub followup_debounce_ms: u64,
    #[serde(default = "d_idle_watchdog_ms")]
    pub idle_watchdog_ms: u64,
    #[serde(default = "d_idle_watchdog_confirm_ms")]
    pub idle_watchdog_confirm_ms: u64,
    #[serde(default = "d_engine_death_grace_ms")]
    pub engine_death_grace_ms: u64,
}

fn d_followup_debounce_ms() -> u64 {
    500
}
fn d_idle_watchdog_ms() -> u64 {
    7_200_000
}
fn d_idle_watchdog_confirm_ms() -> u64 {
    300_000
}
fn d_engine_death_grace_ms() -> u64 {
    200
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            followup_debounce_ms: d_followup_debounce_ms(),
            idle_watchdog_ms: d_idle_watchdog_ms(),
            idle_watchdog_confirm_ms: d_idle_watchdog_confirm_ms(),
            engine_death_grace_ms: d_engine_death_grace_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDefaults {
    #[serde(default = "d_default_engine")]
    pub default_engine: String,
    #[serde(default)]
    pub default_model: Option<String>,
}

fn d_default_engine() -> String {
    "lemon".to_string()
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self { default_engine: d_default_engine(), default_model: None }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool policy tiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-agent and per-channel `ToolPolicy` tiers, keyed by `agent_id` /
/// `channel_id`. The session tier lives in the `Store` (set per
/// conversation, not configured ahead of time); the runtime tier is the
/// group/supergroup/channel `force_dangerous` override applied in the
/// pipeline. A pipeline run merges all four in that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub agents: std::collections::HashMap<String, crate::policy::ToolPolicy>,
    #[serde(default)]
    pub channels: std::collections::HashMap<String, crate::policy::ToolPolicy>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session reset lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-channel or per-peer-type override of the global reset parameters.
/// Mirrors `aw_sessions::lifecycle::ResetOverride` — kept here rather than
/// depended-on directly so `aw-domain` doesn't need a dependency on
/// `aw-sessions` just to own its config shape; the Router converts this
/// into the `aw_sessions` type it actually drives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetOverrideConfig {
    #[serde(default)]
    pub daily_reset_hour: Option<u8>,
    #[serde(default)]
    pub idle_minutes: Option<u32>,
}

/// When a session with no active run should be treated as stale enough to
/// start fresh on its next message (clearing `ChatState` rather than
/// auto-resuming it). `None` fields mean "never reset on that axis".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResetConfig {
    #[serde(default)]
    pub daily_reset_hour: Option<u8>,
    #[serde(default)]
    pub idle_minutes: Option<u32>,
    #[serde(default)]
    pub reset_by_type: std::collections::HashMap<String, ResetOverrideConfig>,
    #[serde(default)]
    pub reset_by_channel: std::collections::HashMap<String, ResetOverrideConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// CORS allowed origins; `["*"]` means permissive.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "d_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn d_host() -> String {
    "0.0.0.0".to_string()
}
fn d_port() -> u16 {
    8080
}
fn d_max_concurrent_requests() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            cors_origins: Vec::new(),
            max_concurrent_requests: d_max_concurrent_requests(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observability (OpenTelemetry)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OpenTelemetry export configuration. When `otlp_endpoint` is `None`
/// (the default), no exporter is started and the gateway logs exactly as
/// it always has — structured JSON on stdout, nothing else. Setting
/// `otlp_endpoint` turns on OTLP/gRPC trace export so every `tracing`
/// span is also forwarded to a collector (Jaeger, Grafana Tempo, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// OTLP gRPC endpoint (e.g. `http://localhost:4317`). `None` disables
    /// export entirely.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default = "d_service_name")]
    pub service_name: String,
    /// Trace sampling rate (`0.0` = never, `1.0` = always), applied via
    /// `TraceIdRatioBased` so the decision is consistent across a trace.
    #[serde(default = "d_sample_rate")]
    pub sample_rate: f64,
}

fn d_service_name() -> String {
    "agentway-gateway".to_string()
}
fn d_sample_rate() -> f64 {
    1.0
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { otlp_endpoint: None, service_name: d_service_name(), sample_rate: d_sample_rate() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub coalescing: CoalescingConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub engines: EngineDefaults,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub session_reset: SessionResetConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues. The CLI
    /// bootstrap bails at startup if any `Error`-severity issue is present.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.scheduler.max_concurrent_runs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.max_concurrent_runs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.scheduler.engine_lock_timeout_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "scheduler.engine_lock_timeout_ms".into(),
                message: "0 means acquire never blocks; likely unintended".into(),
            });
        }
        if self.coalescing.min_chars == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "coalescing.min_chars".into(),
                message: "0 means every delta flushes immediately".into(),
            });
        }
        if self.engines.default_engine.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "engines.default_engine".into(),
                message: "must not be empty".into(),
            });
        }
        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "observability.sample_rate".into(),
                message: "outside [0.0, 1.0]; will be clamped at the OTel layer".into(),
            });
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.max_concurrent_runs, 2);
        assert!(cfg.scheduler.auto_resume);
        assert!(cfg.scheduler.require_engine_lock);
        assert_eq!(cfg.scheduler.engine_lock_timeout_ms, 60_000);
        assert_eq!(cfg.coalescing.min_chars, 48);
        assert_eq!(cfg.coalescing.idle_ms, 400);
        assert_eq!(cfg.coalescing.max_latency_ms, 1_200);
        assert_eq!(cfg.lifecycle.followup_debounce_ms, 500);
        assert_eq!(cfg.lifecycle.idle_watchdog_ms, 7_200_000);
        assert_eq!(cfg.lifecycle.idle_watchdog_confirm_ms, 300_000);
        assert_eq!(cfg.lifecycle.engine_death_grace_ms, 200);
        assert_eq!(cfg.engines.default_engine, "lemon");
    }

    #[test]
    fn validate_flags_zero_concurrency() {
        let mut cfg = Config::default();
        cfg.scheduler.max_concurrent_runs = 0;
        let issues = cfg.validate();
        assert!(Config::has_errors(&issues));
    }

    #[test]
    fn validate_passes_on_defaults() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(!Config::has_errors(&issues));
    }

    #[test]
    fn observability_defaults_to_no_exporter() {
        let cfg = ObservabilityConfig::default();
        assert!(cfg.otlp_endpoint.is_none());
        assert_eq!(cfg.service_name, "agentway-gateway");
        assert!((cfg.sample_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn observability_deserializes_from_toml() {
        let toml_str = r#"
            otlp_endpoint = "http://localhost:4317"
            service_name = "my-gateway"
            sample_rate = 0.5
        "#;
        let cfg: ObservabilityConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.otlp_endpoint.as_deref(), Some("http://localhost:4317"));
        assert_eq!(cfg.service_name, "my-gateway");
        assert!((cfg.sample_rate - 0.5).abs() < f64::EPSILON);
    }
}
