//! `GET /metrics` — Prometheus text exposition format, hand-rolled from the
//! scheduler's admission counters. No metrics crate in the stack; this is
//! the smallest thing that speaks the wire format correctly.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::state::AppState;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.scheduler.counts();
    let body = format!(
        "# HELP agentway_runs_active Runs currently occupying a concurrency slot.\n\
         # TYPE agentway_runs_active gauge\n\
         agentway_runs_active {active}\n\
         # HELP agentway_runs_queued Runs waiting for a concurrency slot.\n\
         # TYPE agentway_runs_queued gauge\n\
         agentway_runs_queued {queued}\n\
         # HELP agentway_runs_completed_today Runs completed since local midnight.\n\
         # TYPE agentway_runs_completed_today counter\n\
         agentway_runs_completed_today {completed_today}\n",
        active = counts.active,
        queued = counts.queued,
        completed_today = counts.completed_today,
    );

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
