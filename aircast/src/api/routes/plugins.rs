//! Plugin routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::plugin::{PluginDescriptor, PluginState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_plugins))
        .route("/{id}", axum::routing::delete(unload_plugin))
        .route("/{id}/reload", post(reload_plugin))
}

async fn list_plugins(State(state): State<AppState>) -> ApiResult<Json<Vec<PluginState>>> {
    Ok(Json(state.registry.list()))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    reloaded: PluginDescriptor,
}

async fn reload_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReloadResponse>> {
    let descriptor = state.registry.reload(&id).await?;
    Ok(Json(ReloadResponse {
        reloaded: descriptor,
    }))
}

async fn unload_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<axum::http::StatusCode> {
    state.registry.unload(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
