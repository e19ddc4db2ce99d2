use axum::{Json, extract::State, response::IntoResponse};
use std::sync::Arc;
use crate::state::AppState;

// Snapshot of in-flight generations, outcome stats and current load
pub async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipeline = &state.pipeline;
    let load = pipeline.load_gate.sample().await;

    Json(serde_json::json!({
        "active": pipeline.executor.active_requests(),
        "stats": pipeline.executor.stats(),
        "load": load,
        "tracked_clients": pipeline.rate_limiter.tracked_keys(),
        "backends": state.load_balancer.status(),
    }))
}
