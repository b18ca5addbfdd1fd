//! `POST /inbound` — the single entry point channel connectors post
//! normalized messages to.
//!
//! Deliberately returns `202 Accepted` with the `run_id` rather than
//! blocking for the run to finish or erroring when the target session is
//! busy: queueing (`collect`/`followup`/`steer`) is the router's job, not
//! the HTTP layer's, so a connector never needs to retry on 429.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use parking_lot::Mutex;

use crate::router::InboundMessage;
use crate::state::AppState;

/// Event-id-keyed idempotency store. A connector that retries a webhook
/// delivery (reconnect, at-least-once queue) should not cause the same
/// message to be routed twice.
pub struct DedupeStore {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupeStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self { seen: Mutex::new(HashMap::new()), ttl })
    }

    /// Returns `true` if `event_id` was already seen within the TTL.
    pub fn check_and_insert(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock();
        let now = Instant::now();

        if seen.len() > 10_000 {
            seen.retain(|_, ts| now.duration_since(*ts) < self.ttl);
        }

        if let Some(ts) = seen.get(event_id) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }
        seen.insert(event_id.to_owned(), now);
        false
    }
}

pub async fn inbound(State(state): State<AppState>, Json(msg): Json<InboundMessage>) -> impl IntoResponse {
    if let Some(event_id) = msg.meta.get("event_id").and_then(|v| v.as_str()) {
        if state.dedupe.check_and_insert(event_id) {
            return (StatusCode::OK, Json(serde_json::json!({"ok": true, "duplicate": true})));
        }
    }

    let outcome = state.router.handle_inbound(msg);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"ok": true, "run_id": outcome.run_id, "session_key": outcome.session_key})),
    )
}
