//! Inbound pipeline: turn a normalized [`InboundMessage`] into a
//! submitted [`Job`], plus the model/engine precedence and policy-merge
//! helpers the pipeline leans on.
//!
//! Pipeline, in order: session-key resolution, agent resolution, resume
//! extraction, sticky-engine extraction, model/engine selection, policy
//! merge, pending-compaction consumption, submit.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aw_domain::config::{Config, SessionResetConfig};
use aw_domain::job::{Job, JobMeta, Lane, QueueMode};
use aw_domain::policy::{merge_chain, ToolPolicy};
use aw_domain::session::{PeerKind, ResumeToken};
use aw_engine::EngineRegistry;
use aw_sessions::{resolve_session_key, InboundMeta, LifecycleManager, ResetContext, ResetOverride, SessionLifecycleConfig, SessionRegistry};

use crate::runtime::scheduler::Scheduler;
use crate::runtime::store::Store;

// ── Wire schema ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundPeer {
    pub kind: PeerKind,
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundSender {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundText {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

/// Normalized inbound envelope, stable across channels. Channel adapters
/// translate their own webhook payloads into this shape before posting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundMessage {
    pub channel_id: String,
    pub account_id: String,
    pub peer: InboundPeer,
    #[serde(default)]
    pub sender: Option<InboundSender>,
    pub message: InboundText,
    #[serde(default)]
    pub raw: serde_json::Value,
    #[serde(default)]
    pub meta: JobMeta,
}

/// What `Router::handle_inbound`/`handle_control` return on success.
#[derive(Debug, Clone, Serialize)]
pub struct InboundOutcome {
    pub run_id: Uuid,
    pub session_key: String,
}

fn meta_str<'a>(meta: &'a JobMeta, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(|v| v.as_str())
}

fn meta_bool(meta: &JobMeta, key: &str) -> bool {
    meta.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

// ── Resume / sticky-engine extraction (pipeline steps 3-4) ──────────

fn resume_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^\s*(\w+)\s+resume\s+(\S+)\s*$").unwrap())
}

fn claude_resume_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^\s*claude\s+--resume\s+(\S+)\s*$").unwrap())
}

fn sticky_engine_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:use|switch to|with)\s+(\w+)\b").unwrap())
}

/// Scan `text` for a `<engine> resume <value>` line (or its `claude
/// --resume <value>` synonym). Returns the stripped prompt and the
/// extracted token when the named engine is registered.
fn extract_resume(text: &str, engines: &EngineRegistry) -> (String, Option<ResumeToken>) {
    if let Some(caps) = claude_resume_re().captures(text) {
        if engines.get("claude").is_some() {
            let value = caps[1].to_owned();
            let stripped = claude_resume_re().replace(text, "").trim().to_owned();
            return (stripped, Some(ResumeToken { engine_id: "claude".into(), value }));
        }
    }
    if let Some(caps) = resume_line_re().captures(text) {
        let engine_id = caps[1].to_lowercase();
        if engines.get(&engine_id).is_some() {
            let value = caps[2].to_owned();
            let stripped = resume_line_re().replace(text, "").trim().to_owned();
            return (stripped, Some(ResumeToken { engine_id, value }));
        }
    }
    (text.to_owned(), None)
}

/// Scan for `use <engine>` / `switch to <engine>` / `with <engine>`,
/// returning the engine id when it names a registered engine.
fn extract_sticky_engine(text: &str, engines: &EngineRegistry) -> Option<String> {
    let caps = sticky_engine_re().captures(text)?;
    let engine_id = caps[1].to_lowercase();
    engines.get(&engine_id).map(|_| engine_id)
}

// ── Model/engine precedence ──────────────────────────────────────────

/// `gpt-*` implies `openai`, `claude-*` implies `claude`, and a
/// `<engine>:<model>` form names its engine directly. No match means the
/// model doesn't imply a particular engine.
fn model_implied_engine(model: &str) -> Option<String> {
    if let Some((prefix, _)) = model.split_once(':') {
        return Some(prefix.to_lowercase());
    }
    if model.starts_with("gpt-") {
        return Some("openai".into());
    }
    if model.starts_with("claude-") {
        return Some("claude".into());
    }
    None
}

/// Model precedence: request-explicit, then the profile/router default.
/// `ChatState` carries no model field to resume from, so there is no
/// session-stored tier to consult (see DESIGN.md).
fn resolve_model(meta: &JobMeta, config: &Config) -> Option<String> {
    meta_str(meta, "model").map(str::to_owned).or_else(|| config.engines.default_model.clone())
}

/// Engine precedence: resume token's engine, request-explicit (sticky
/// extraction or an explicit `meta.engine_id`), model-implied, then `None`
/// — left for the Scheduler's auto-resume/registry default to fill in.
/// Attaches a `warning` to `meta` if the explicit engine and the
/// model-implied engine disagree (explicit wins).
fn resolve_engine(resume: &Option<ResumeToken>, sticky_engine: Option<&str>, model: Option<&str>, meta: &mut JobMeta) -> Option<String> {
    if let Some(resume) = resume {
        return Some(resume.engine_id.clone());
    }

    let explicit = meta_str(meta, "engine_id").map(str::to_owned).or_else(|| sticky_engine.map(str::to_owned));
    let model_implied = model.and_then(model_implied_engine);

    match (&explicit, &model_implied) {
        (Some(e), Some(m)) if e != m => {
            meta.insert(
                "warning".into(),
                serde_json::json!(format!("explicit engine '{e}' overrides model-implied engine '{m}'")),
            );
            Some(e.clone())
        }
        (Some(e), _) => Some(e.clone()),
        (None, Some(m)) => Some(m),
        (None, None) => None,
    }
}

/// Translate the domain config's wire-friendly `SessionResetConfig` into the
/// `aw_sessions` shape `LifecycleManager` actually drives.
fn lifecycle_config_from(cfg: &SessionResetConfig) -> SessionLifecycleConfig {
    let convert = |m: &std::collections::HashMap<String, aw_domain::config::ResetOverrideConfig>| {
        m.iter()
            .map(|(k, v)| (k.clone(), ResetOverride { daily_reset_hour: v.daily_reset_hour, idle_minutes: v.idle_minutes }))
            .collect()
    };
    SessionLifecycleConfig {
        daily_reset_hour: cfg.daily_reset_hour,
        idle_minutes: cfg.idle_minutes,
        reset_by_type: convert(&cfg.reset_by_type),
        reset_by_channel: convert(&cfg.reset_by_channel),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub struct Router {
    scheduler: Arc<Scheduler>,
    store: Arc<dyn Store>,
    config: Arc<Config>,
    engines: Arc<EngineRegistry>,
    sessions: SessionRegistry,
    lifecycle: LifecycleManager,
}

impl Router {
    pub fn new(scheduler: Arc<Scheduler>, store: Arc<dyn Store>, config: Arc<Config>, engines: Arc<EngineRegistry>) -> Self {
        let lifecycle = LifecycleManager::new(lifecycle_config_from(&config.session_reset));
        Self { scheduler, store, config, engines, sessions: SessionRegistry::new(), lifecycle }
    }

    /// Channel-origin entry point: `queue_mode` defaults to `collect`
    /// unless `meta.steer` is set, matching a channel message that should
    /// pile onto an in-flight run rather than interrupt it.
    pub fn handle_inbound(&self, msg: InboundMessage) -> InboundOutcome {
        let queue_mode = if meta_bool(&msg.meta, "steer") { QueueMode::Steer } else { QueueMode::Collect };
        self.run_pipeline(msg, &msg_origin(&msg), queue_mode)
    }

    /// Control-plane entry point: same pipeline, `origin = control_plane`,
    /// `queue_mode` defaults to `followup` (a control-plane caller expects
    /// its message delivered distinctly, not merged into pending backlog).
    pub fn handle_control(&self, msg: InboundMessage) -> InboundOutcome {
        let queue_mode = if meta_bool(&msg.meta, "steer") { QueueMode::Steer } else { QueueMode::Followup };
        self.run_pipeline(msg, "control_plane", queue_mode)
    }

    fn run_pipeline(&self, msg: InboundMessage, origin: &str, queue_mode: QueueMode) -> InboundOutcome {
        let agent_id = meta_str(&msg.meta, "agent_id").unwrap_or("default").to_owned();

        let inbound_meta = InboundMeta {
            channel_id: Some(msg.channel_id.clone()),
            account_id: Some(msg.account_id.clone()),
            peer_kind: Some(msg.peer.kind),
            peer_id: Some(msg.peer.id.clone()),
            thread_id: msg.peer.thread_id.clone(),
            sub_id: None,
            explicit_session_key: meta_str(&msg.meta, "explicit_session_key").map(str::to_owned),
        };
        let session_key = resolve_session_key(&agent_id, &inbound_meta);
        let is_group_like = !msg.peer.kind.is_direct();
        self.apply_session_reset(session_key.as_str(), &msg, is_group_like);

        let (prompt, resume) = extract_resume(&msg.message.text, &self.engines);
        let sticky_engine = extract_sticky_engine(&prompt, &self.engines);

        let mut meta = msg.meta.clone();
        let model = resolve_model(&meta, &self.config);
        let engine_id = resolve_engine(&resume, sticky_engine.as_deref(), model.as_deref(), &mut meta);

        let agent_policy = self.config.policy.agents.get(&agent_id).cloned().unwrap_or_default();
        let channel_policy = self.config.policy.channels.get(&msg.channel_id).cloned().unwrap_or_default();
        let session_policy = self.store.get_session_policy(session_key.as_str()).unwrap_or_default();
        let mut merged = merge_chain(&[&agent_policy, &channel_policy, &session_policy]);
        if is_group_like {
            merged = merged.force_dangerous(&["bash", "write", "process"]);
        }

        let mut job = Job::new(session_key.as_str(), agent_id, prompt, origin);
        job.model = model;
        job.engine_id = engine_id;
        job.resume = resume;
        job.queue_mode = queue_mode;
        job.lane = Lane::Main;
        job.tool_policy = Some(merged);
        job.meta = meta;

        self.consume_pending_compaction(session_key.as_str(), &mut job);

        let run_id = self.scheduler.submit(job);
        InboundOutcome { run_id, session_key: session_key.as_str().to_owned() }
    }

    /// Check whether this session has gone stale enough (daily boundary or
    /// idle timeout, per-channel/per-type overrides applied) to start fresh
    /// rather than auto-resume. A reset clears durable chat state and mints
    /// a new `SessionEntry`; otherwise the entry is just touched so the
    /// next check measures idle time from this message.
    fn apply_session_reset(&self, session_key: &str, msg: &InboundMessage, is_group_like: bool) {
        let (entry, _is_new) = self.sessions.resolve_or_create(session_key);
        let ctx = ResetContext {
            channel: Some(msg.channel_id.clone()),
            is_direct: !is_group_like,
            has_thread: msg.peer.thread_id.is_some(),
        };
        match self.lifecycle.should_reset(&entry, &ctx, chrono::Utc::now()) {
            Some(reason) => {
                self.sessions.reset(session_key, &reason.to_string());
                self.store.delete_chat_state(session_key);
            }
            None => self.sessions.touch(session_key),
        }
    }

    fn consume_pending_compaction(&self, session_key: &str, job: &mut Job) {
        if meta_bool(&job.meta, "auto_compacted") {
            return;
        }
        let Some(marker) = self.store.get_pending_compaction(session_key) else { return };
        if !marker.is_fresh(chrono::Utc::now()) {
            return;
        }
        job.prompt = format!("[context was compacted: {}]\n{}", marker.reason, job.prompt);
        job.meta.insert("auto_compacted".into(), serde_json::json!(true));
    }

    pub fn cancel_by_session(&self, session_key: &str, reason: &str) {
        self.scheduler.cancel_by_session(session_key, reason);
    }

    pub fn cancel_by_run_id(&self, run_id: Uuid, reason: &str) {
        self.scheduler.cancel_by_run_id(run_id, reason);
    }
}

fn msg_origin(msg: &InboundMessage) -> String {
    msg.channel_id.clone()
}
