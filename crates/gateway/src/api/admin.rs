//! Health probe and admin cancel endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::state::AppState;

/// `GET /healthz` — liveness probe. Never touches the scheduler; a
/// gateway that can answer this is at least accepting connections.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CancelTarget {
    BySession { session_key: String },
    ByRun { run_id: uuid::Uuid },
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(flatten)]
    pub target: CancelTarget,
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "admin_cancel".to_owned()
}

/// `POST /admin/cancel` — cancel a run by id, or every run on a session
/// (cascading to any subagent sessions it spawned).
pub async fn cancel(State(state): State<AppState>, Json(req): Json<CancelRequest>) -> impl IntoResponse {
    match req.target {
        CancelTarget::BySession { session_key } => {
            state.router.cancel_by_session(&session_key, &req.reason);
        }
        CancelTarget::ByRun { run_id } => {
            state.router.cancel_by_run_id(run_id, &req.reason);
        }
    }
    (StatusCode::ACCEPTED, Json(serde_json::json!({"ok": true})))
}
