//! Persistence facade (table: chat/runs/run_history/progress_index/
//! endpoints/sessions_index/pending_compaction).
//!
//! A thin key-value abstraction, not a database: each table is an
//! independent namespace a caller addresses by key. The only failure mode a
//! caller needs to handle is [`aw_domain::error::Error::StoreUnavailable`] —
//! everything else (missing key, wrong shape) is represented as `Option`/
//! `Vec` at the call site, never as an error. Implementations must give
//! read-your-writes: a `put` followed by a `get` on the same key, on the
//! same store handle, always observes the write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use aw_domain::error::{Error, Result};
use aw_domain::policy::ToolPolicy;
use aw_domain::run::Run;
use aw_domain::session::{ChatState, PendingCompaction};

/// One entry in the append-only run history table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunHistoryEntry {
    pub run_id: uuid::Uuid,
    pub session_key: String,
    pub ok: bool,
    pub error: Option<String>,
    pub ended_at: chrono::DateTime<Utc>,
}

/// A registered channel endpoint (one per `{channel_id, account_id}`),
/// recorded so admin tooling can list where this gateway is reachable from.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointRecord {
    pub channel_id: String,
    pub account_id: String,
    pub registered_at: chrono::DateTime<Utc>,
}

/// Persistence surface the rest of the fabric depends on. One
/// implementation backs every table; callers never reach into table
/// internals directly.
///
/// Degrades rather than crashes: if the backing store is unavailable, reads
/// return as-if-absent and writes are best-effort, matching the `:store_unavailable`
/// policy (a Run must never fail solely because the store is down).
pub trait Store: Send + Sync {
    fn get_chat_state(&self, session_key: &str) -> Option<ChatState>;
    fn put_chat_state(&self, state: ChatState) -> Result<()>;
    fn delete_chat_state(&self, session_key: &str);

    fn get_pending_compaction(&self, session_key: &str) -> Option<PendingCompaction>;
    fn put_pending_compaction(&self, marker: PendingCompaction) -> Result<()>;
    fn clear_pending_compaction(&self, session_key: &str);

    fn put_run(&self, run: Run) -> Result<()>;
    fn get_run(&self, run_id: uuid::Uuid) -> Option<Run>;
    fn list_runs_for_session(&self, session_key: &str) -> Vec<Run>;
    fn delete_run(&self, run_id: uuid::Uuid);

    fn append_run_history(&self, entry: RunHistoryEntry) -> Result<()>;
    fn list_run_history(&self, session_key: &str) -> Vec<RunHistoryEntry>;

    /// Progress index: maps a `run_id` to the last delta `seq` observed, so
    /// a reconnecting output tracker can resume mid-stream instead of
    /// replaying from zero.
    fn set_progress(&self, run_id: uuid::Uuid, seq: u64);
    fn get_progress(&self, run_id: uuid::Uuid) -> Option<u64>;

    fn register_endpoint(&self, record: EndpointRecord) -> Result<()>;
    fn list_endpoints(&self) -> Vec<EndpointRecord>;

    /// Per-session_key index of sessions seen, for admin listing/aborts.
    fn index_session(&self, session_key: &str);
    fn list_indexed_sessions(&self) -> Vec<String>;

    /// Session-tier `ToolPolicy` override, set by an admin/control-plane
    /// call rather than config — the only tier that can change mid-session.
    fn get_session_policy(&self, session_key: &str) -> Option<ToolPolicy>;
    fn put_session_policy(&self, session_key: &str, policy: ToolPolicy) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    chat: HashMap<String, ChatState>,
    pending_compaction: HashMap<String, PendingCompaction>,
    runs: HashMap<uuid::Uuid, Run>,
    run_history: HashMap<String, Vec<RunHistoryEntry>>,
    progress_index: HashMap<uuid::Uuid, u64>,
    endpoints: Vec<EndpointRecord>,
    sessions_index: Vec<String>,
    session_policy: HashMap<String, ToolPolicy>,
}

/// In-memory `Store`. Good enough for a single-process gateway; a durable
/// backend (sled, sqlite, ...) would implement the same trait behind the
/// same call sites.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Store for MemoryStore {
    fn get_chat_state(&self, session_key: &str) -> Option<ChatState> {
        let state = self.tables.read().chat.get(session_key).cloned()?;
        if state.is_expired(Utc::now()) {
            return None;
        }
        Some(state)
    }

    fn put_chat_state(&self, state: ChatState) -> Result<()> {
        self.tables.write().chat.insert(state.session_key.clone(), state);
        Ok(())
    }

    fn delete_chat_state(&self, session_key: &str) {
        self.tables.write().chat.remove(session_key);
    }

    fn get_pending_compaction(&self, session_key: &str) -> Option<PendingCompaction> {
        self.tables.read().pending_compaction.get(session_key).cloned()
    }

    fn put_pending_compaction(&self, marker: PendingCompaction) -> Result<()> {
        self.tables
            .write()
            .pending_compaction
            .insert(marker.session_key.clone(), marker);
        Ok(())
    }

    fn clear_pending_compaction(&self, session_key: &str) {
        self.tables.write().pending_compaction.remove(session_key);
    }

    fn put_run(&self, run: Run) -> Result<()> {
        self.tables.write().runs.insert(run.run_id, run);
        Ok(())
    }

    fn get_run(&self, run_id: uuid::Uuid) -> Option<Run> {
        self.tables.read().runs.get(&run_id).cloned()
    }

    fn list_runs_for_session(&self, session_key: &str) -> Vec<Run> {
        self.tables
            .read()
            .runs
            .values()
            .filter(|r| r.session_key == session_key)
            .cloned()
            .collect()
    }

    fn delete_run(&self, run_id: uuid::Uuid) {
        self.tables.write().runs.remove(&run_id);
    }

    fn append_run_history(&self, entry: RunHistoryEntry) -> Result<()> {
        self.tables
            .write()
            .run_history
            .entry(entry.session_key.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    fn list_run_history(&self, session_key: &str) -> Vec<RunHistoryEntry> {
        self.tables
            .read()
            .run_history
            .get(session_key)
            .cloned()
            .unwrap_or_default()
    }

    fn set_progress(&self, run_id: uuid::Uuid, seq: u64) {
        self.tables.write().progress_index.insert(run_id, seq);
    }

    fn get_progress(&self, run_id: uuid::Uuid) -> Option<u64> {
        self.tables.read().progress_index.get(&run_id).copied()
    }

    fn register_endpoint(&self, record: EndpointRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables
            .endpoints
            .iter()
            .any(|e| e.channel_id == record.channel_id && e.account_id == record.account_id)
        {
            tables.endpoints.push(record);
        }
        Ok(())
    }

    fn list_endpoints(&self) -> Vec<EndpointRecord> {
        self.tables.read().endpoints.clone()
    }

    fn index_session(&self, session_key: &str) {
        let mut tables = self.tables.write();
        if !tables.sessions_index.iter().any(|s| s == session_key) {
            tables.sessions_index.push(session_key.to_owned());
        }
    }

    fn list_indexed_sessions(&self) -> Vec<String> {
        self.tables.read().sessions_index.clone()
    }

    fn get_session_policy(&self, session_key: &str) -> Option<ToolPolicy> {
        self.tables.read().session_policy.get(session_key).cloned()
    }

    fn put_session_policy(&self, session_key: &str, policy: ToolPolicy) -> Result<()> {
        self.tables.write().session_policy.insert(session_key.to_owned(), policy);
        Ok(())
    }
}

/// Wraps any `Store` and forces every call to behave as if the backend were
/// down — reads empty, writes fail with [`Error::StoreUnavailable`]. Used in
/// tests that exercise the degrade-not-crash paths of `Run` and `Scheduler`.
#[derive(Default)]
pub struct UnavailableStore;

impl Store for UnavailableStore {
    fn get_chat_state(&self, _session_key: &str) -> Option<ChatState> {
        None
    }
    fn put_chat_state(&self, _state: ChatState) -> Result<()> {
        Err(Error::StoreUnavailable("chat table unreachable".into()))
    }
    fn delete_chat_state(&self, _session_key: &str) {}

    fn get_pending_compaction(&self, _session_key: &str) -> Option<PendingCompaction> {
        None
    }
    fn put_pending_compaction(&self, _marker: PendingCompaction) -> Result<()> {
        Err(Error::StoreUnavailable("pending_compaction table unreachable".into()))
    }
    fn clear_pending_compaction(&self, _session_key: &str) {}

    fn put_run(&self, _run: Run) -> Result<()> {
        Err(Error::StoreUnavailable("runs table unreachable".into()))
    }
    fn get_run(&self, _run_id: uuid::Uuid) -> Option<Run> {
        None
    }
    fn list_runs_for_session(&self, _session_key: &str) -> Vec<Run> {
        Vec::new()
    }
    fn delete_run(&self, _run_id: uuid::Uuid) {}

    fn append_run_history(&self, _entry: RunHistoryEntry) -> Result<()> {
        Err(Error::StoreUnavailable("run_history table unreachable".into()))
    }
    fn list_run_history(&self, _session_key: &str) -> Vec<RunHistoryEntry> {
        Vec::new()
    }

    fn set_progress(&self, _run_id: uuid::Uuid, _seq: u64) {}
    fn get_progress(&self, _run_id: uuid::Uuid) -> Option<u64> {
        None
    }

    fn register_endpoint(&self, _record: EndpointRecord) -> Result<()> {
        Err(Error::StoreUnavailable("endpoints table unreachable".into()))
    }
    fn list_endpoints(&self) -> Vec<EndpointRecord> {
        Vec::new()
    }

    fn index_session(&self, _session_key: &str) {}
    fn list_indexed_sessions(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_session_policy(&self, _session_key: &str) -> Option<ToolPolicy> {
        None
    }
    fn put_session_policy(&self, _session_key: &str, _policy: ToolPolicy) -> Result<()> {
        Err(Error::StoreUnavailable("session_policy table unreachable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_domain::job::Job;

    #[test]
    fn chat_state_read_your_writes() {
        let store = MemoryStore::new();
        let state = ChatState::new("agent:a:main", "lemon", None);
        store.put_chat_state(state.clone()).unwrap();
        let got = store.get_chat_state("agent:a:main").unwrap();
        assert_eq!(got.engine_id, "lemon");
    }

    #[test]
    fn expired_chat_state_reads_as_absent() {
        let store = MemoryStore::new();
        let mut state = ChatState::new("agent:a:main", "lemon", None);
        state.expires_at = Utc::now() - chrono::Duration::hours(1);
        store.put_chat_state(state).unwrap();
        assert!(store.get_chat_state("agent:a:main").is_none());
    }

    #[test]
    fn run_history_accumulates_per_session() {
        let store = MemoryStore::new();
        let entry = RunHistoryEntry {
            run_id: uuid::Uuid::new_v4(),
            session_key: "agent:a:main".into(),
            ok: true,
            error: None,
            ended_at: Utc::now(),
        };
        store.append_run_history(entry).unwrap();
        assert_eq!(store.list_run_history("agent:a:main").len(), 1);
        assert_eq!(store.list_run_history("agent:b:main").len(), 0);
    }

    #[test]
    fn endpoint_registration_is_deduplicated() {
        let store = MemoryStore::new();
        let rec = EndpointRecord {
            channel_id: "telegram".into(),
            account_id: "acct1".into(),
            registered_at: Utc::now(),
        };
        store.register_endpoint(rec.clone()).unwrap();
        store.register_endpoint(rec).unwrap();
        assert_eq!(store.list_endpoints().len(), 1);
    }

    #[test]
    fn unavailable_store_degrades_instead_of_panicking() {
        let store = UnavailableStore;
        assert!(store.get_chat_state("k").is_none());
        assert!(matches!(
            store.put_chat_state(ChatState::new("k", "lemon", None)),
            Err(Error::StoreUnavailable(_))
        ));
        let job = Job::new("k", "default", "hi", "telegram");
        let run = Run::new(job);
        assert!(matches!(store.put_run(run), Err(Error::StoreUnavailable(_))));
    }
}
