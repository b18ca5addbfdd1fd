//! Session-key resolution from inbound metadata.
//!
//! Two canonical forms: `agent:<agent_id>:main` for the agent-wide DM, and
//! the channel/peer form for everything else (group, supergroup, channel,
//! or a DM scoped per-peer). Callers compute a session key once per inbound
//! message; the Router uses it unchanged from there on.

use aw_domain::session::{PeerKind, SessionKey};

/// Everything the Router extracts from an inbound message that session-key
/// resolution needs.
#[derive(Debug, Clone, Default)]
pub struct InboundMeta {
    pub channel_id: Option<String>,
    pub account_id: Option<String>,
    pub peer_kind: Option<PeerKind>,
    pub peer_id: Option<String>,
    pub thread_id: Option<String>,
    pub sub_id: Option<String>,
    /// An already-computed, pre-validated session key supplied by the
    /// channel adapter (e.g. a control-plane client addressing a session
    /// directly). Takes precedence over derivation when well-formed.
    pub explicit_session_key: Option<String>,
}

/// A well-formed explicit session key starts with `agent:` and has no
/// embedded whitespace; anything else is treated as absent.
fn is_well_formed(key: &str) -> bool {
    key.starts_with("agent:") && !key.contains(char::is_whitespace) && key.len() > "agent:".len()
}

/// Resolve the session key for one inbound message: use the explicit key
/// if present and well-formed, otherwise derive the channel/peer form (or
/// the agent-wide main key for a DM with no per-peer scoping requested).
pub fn resolve_session_key(agent_id: &str, meta: &InboundMeta) -> SessionKey {
    if let Some(explicit) = &meta.explicit_session_key {
        if is_well_formed(explicit) {
            return SessionKey::from(explicit.as_str());
        }
    }

    match (&meta.peer_kind, &meta.peer_id) {
        (Some(kind), Some(peer_id)) => SessionKey::channel_peer(
            agent_id,
            meta.channel_id.as_deref().unwrap_or("default"),
            meta.account_id.as_deref().unwrap_or("default"),
            *kind,
            peer_id,
            meta.thread_id.as_deref(),
            meta.sub_id.as_deref(),
        ),
        _ => SessionKey::main(agent_id),
    }
}
