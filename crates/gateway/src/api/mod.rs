pub mod admin;
pub mod inbound;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full HTTP surface. Every route is public — the fabric is
/// meant to sit behind a channel connector or an internal network
/// boundary, not be exposed directly to end users.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(admin::health))
        .route("/metrics", get(metrics::metrics))
        .route("/inbound", post(inbound::inbound))
        .route("/admin/cancel", post(admin::cancel))
}
