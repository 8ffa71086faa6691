//! Health routes.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::metrics::ComponentHealth;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
    components: Vec<ComponentHealth>,
    queue: crate::jobs::QueueStats,
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let system = state.health.check_all().await;
    Ok(Json(HealthResponse {
        status: system.status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        components: system.components,
        queue: state.queue.stats(),
    }))
}
