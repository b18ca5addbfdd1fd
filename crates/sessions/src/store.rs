//! Session registry.
//!
//! Tracks `{session_key -> SessionEntry}` bookkeeping the Router consults
//! for lifecycle resets: when a session was first seen and when it was
//! last touched. This is distinct from the gateway's per-run registry —
//! a session can outlive many runs, and resets here don't imply a run is
//! in flight.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use aw_domain::trace::TraceEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory session registry, `RwLock`-guarded so readers don't block
/// each other: writers are rare relative to reads (one per inbound
/// message vs. one per reset/touch).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_key).cloned()
    }

    /// Resolve or create a session entry for `session_key`. Returns
    /// `(entry, is_new)`.
    pub fn resolve_or_create(&self, session_key: &str) -> (SessionEntry, bool) {
        {
            let sessions = self.sessions.read();
            if let Some(entry) = sessions.get(session_key) {
                return (entry.clone(), false);
            }
        }

        let now = Utc::now();
        let entry = SessionEntry {
            session_key: session_key.to_owned(),
            created_at: now,
            updated_at: now,
        };

        let mut sessions = self.sessions.write();
        // Another writer may have raced us between the read above and this
        // write lock; prefer whichever entry already landed.
        let entry = sessions.entry(session_key.to_owned()).or_insert(entry).clone();

        TraceEvent::SessionResolved {
            session_key: session_key.to_owned(),
            is_new: true,
        }
        .emit();

        (entry, true)
    }

    /// Reset a session: mint a fresh `created_at`/`updated_at` for the same
    /// key, as if it were seen for the first time.
    pub fn reset(&self, session_key: &str, reason: &str) -> Option<SessionEntry> {
        let mut sessions = self.sessions.write();
        let entry = sessions.get_mut(session_key)?;

        let now = Utc::now();
        entry.created_at = now;
        entry.updated_at = now;

        TraceEvent::SessionReset {
            session_key: session_key.to_owned(),
            old_session_id: session_key.to_owned(),
            new_session_id: session_key.to_owned(),
            reason: reason.to_owned(),
        }
        .emit();

        Some(entry.clone())
    }

    pub fn touch(&self, session_key: &str) {
        if let Some(entry) = self.sessions.write().get_mut(session_key) {
            entry.updated_at = Utc::now();
        }
    }

    pub fn list(&self) -> Vec<SessionEntry> {
        self.sessions.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_or_create_is_idempotent() {
        let reg = SessionRegistry::new();
        let (e1, new1) = reg.resolve_or_create("agent:a:main");
        assert!(new1);
        let (e2, new2) = reg.resolve_or_create("agent:a:main");
        assert!(!new2);
        assert_eq!(e1.session_key, e2.session_key);
    }

    #[test]
    fn reset_mints_fresh_timestamps() {
        let reg = SessionRegistry::new();
        let (first, _) = reg.resolve_or_create("agent:a:main");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let reset = reg.reset("agent:a:main", "daily_reset").unwrap();
        assert!(reset.created_at > first.created_at);
    }

    #[test]
    fn touch_updates_last_activity() {
        let reg = SessionRegistry::new();
        let (first, _) = reg.resolve_or_create("agent:a:main");
        std::thread::sleep(std::time::Duration::from_millis(5));
        reg.touch("agent:a:main");
        let after = reg.get("agent:a:main").unwrap();
        assert!(after.updated_at > first.updated_at);
    }
}
