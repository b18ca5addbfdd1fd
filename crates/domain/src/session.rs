//! Session identity — the opaque `SessionKey` the scheduler routes on, the
//! `ResumeToken` an engine hands back, and the durable `ChatState` that ties
//! the two together for auto-resume.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default TTL for a `ChatState` entry.
pub const CHAT_STATE_TTL: Duration = Duration::hours(24);

/// Peer kind for a non-direct (or direct) inbound message. A closed enum
/// rather than a duck-typed record, since the scheduler only ever branches
/// on a fixed set of peer shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Dm,
    Group,
    Supergroup,
    Channel,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Dm => "dm",
            PeerKind::Group => "group",
            PeerKind::Supergroup => "supergroup",
            PeerKind::Channel => "channel",
        }
    }

    /// Non-DM peers are always group-like for policy purposes.
    pub fn is_direct(&self) -> bool {
        matches!(self, PeerKind::Dm)
    }
}

/// Opaque string identity for one logical conversation. Equality and
/// thread-key derivation are the only operations the scheduler performs on
/// it; the two canonical forms are produced by [`SessionKey::main`] and
/// [`SessionKey::channel_peer`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub String);

impl SessionKey {
    /// `agent:<agent_id>:main`
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    /// `agent:<agent_id>:<channel_id>:<account_id>:<peer_kind>:<peer_id>[:thread:<thread_id>][:sub:<sub_id>]`
    #[allow(clippy::too_many_arguments)]
    pub fn channel_peer(
        agent_id: &str,
        channel_id: &str,
        account_id: &str,
        peer_kind: PeerKind,
        peer_id: &str,
        thread_id: Option<&str>,
        sub_id: Option<&str>,
    ) -> Self {
        let mut s = format!(
            "agent:{agent_id}:{channel_id}:{account_id}:{}:{peer_id}",
            peer_kind.as_str()
        );
        if let Some(t) = thread_id {
            s.push_str(&format!(":thread:{t}"));
        }
        if let Some(sub) = sub_id {
            s.push_str(&format!(":sub:{sub}"));
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque token an engine hands back so a later run can continue the same
/// underlying session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine_id: String,
    pub value: String,
}

/// Durable auto-resume state keyed by session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatState {
    pub session_key: String,
    pub engine_id: String,
    #[serde(default)]
    pub resume: Option<ResumeToken>,
    pub expires_at: DateTime<Utc>,
}

impl ChatState {
    pub fn new(session_key: impl Into<String>, engine_id: impl Into<String>, resume: Option<ResumeToken>) -> Self {
        Self {
            session_key: session_key.into(),
            engine_id: engine_id.into(),
            resume,
            expires_at: Utc::now() + CHAT_STATE_TTL,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Engine-id match with compositional fallback: `"claude:claude-3-opus"`
    /// falls back to `"claude"`.
    pub fn engine_matches(&self, requested: &str) -> bool {
        if self.engine_id == requested {
            return true;
        }
        let base = requested.split(':').next().unwrap_or(requested);
        self.engine_id == base || self.engine_id.split(':').next().unwrap_or(&self.engine_id) == base
    }
}

/// Marker left behind by a context-overflow completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCompaction {
    pub session_key: String,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

/// A pending compaction marker is only honored for 12h and only if the
/// session hasn't already been auto-compacted.
pub const PENDING_COMPACTION_TTL: Duration = Duration::hours(12);

impl PendingCompaction {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.ts) < PENDING_COMPACTION_TTL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_main_form() {
        assert_eq!(SessionKey::main("default").as_str(), "agent:default:main");
    }

    #[test]
    fn session_key_channel_peer_form() {
        let k = SessionKey::channel_peer("default", "telegram", "a1", PeerKind::Dm, "99", None, None);
        assert_eq!(k.as_str(), "agent:default:telegram:a1:dm:99");
    }

    #[test]
    fn session_key_with_thread() {
        let k = SessionKey::channel_peer(
            "default",
            "discord",
            "a1",
            PeerKind::Group,
            "server42",
            Some("thread99"),
            None,
        );
        assert_eq!(k.as_str(), "agent:default:discord:a1:group:server42:thread:thread99");
    }

    #[test]
    fn engine_matches_exact() {
        let cs = ChatState::new("k", "lemon", None);
        assert!(cs.engine_matches("lemon"));
    }

    #[test]
    fn engine_matches_compositional_fallback() {
        let cs = ChatState::new("k", "claude", None);
        assert!(cs.engine_matches("claude:claude-3-opus"));
    }

    #[test]
    fn engine_matches_rejects_unrelated() {
        let cs = ChatState::new("k", "claude", None);
        assert!(!cs.engine_matches("openai"));
    }

    #[test]
    fn chat_state_expiry() {
        let cs = ChatState::new("k", "lemon", None);
        assert!(!cs.is_expired(Utc::now()));
        assert!(cs.is_expired(Utc::now() + Duration::hours(25)));
    }

    #[test]
    fn pending_compaction_freshness() {
        let pc = PendingCompaction {
            session_key: "k".into(),
            reason: "overflow".into(),
            ts: Utc::now() - Duration::hours(13),
        };
        assert!(!pc.is_fresh(Utc::now()));
    }
}
