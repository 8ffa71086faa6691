//! Radio channel routes.
//!
//! Nested under `/radio/channels`.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::routes::require_permission;
use crate::api::server::AppState;
use crate::radio::{RadioChannelConfig, RadioChannelStatus, RadioTrack};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_channel).get(list_channels))
        .route(
            "/{id}",
            get(channel_status).put(update_channel).delete(delete_channel),
        )
        .route("/{id}/start", post(start_channel))
        .route("/{id}/stop", post(stop_channel))
        .route("/{id}/playlist", put(set_playlist).get(get_playlist))
        .route("/{id}/tracks", post(add_track))
        .route("/{id}/tracks/{track_id}", axum::routing::delete(remove_track))
        .route("/{id}/skip", post(skip_track))
        .route("/{id}/now-playing", get(now_playing))
        .route("/{id}/auto-dj", put(set_auto_dj))
}

#[derive(Debug, Serialize)]
struct CreateResponse {
    id: String,
}

async fn create_channel(
    State(state): State<AppState>,
    Json(config): Json<RadioChannelConfig>,
) -> ApiResult<(StatusCode, Json<CreateResponse>)> {
    require_permission(&state, &config.tenant_id, "", "media.radio.manage").await?;
    let id = state.radio.create_channel(config)?;
    Ok((StatusCode::CREATED, Json(CreateResponse { id })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
}

async fn list_channels(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RadioChannelStatus>>> {
    Ok(Json(state.radio.list_channels(query.tenant_id.as_deref())))
}

async fn channel_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RadioChannelStatus>> {
    Ok(Json(state.radio.channel_status(&id)?))
}

async fn update_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<RadioChannelConfig>,
) -> ApiResult<StatusCode> {
    state.radio.update_channel(&id, config)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.radio.delete_channel(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct StartResponse {
    stream_url: String,
}

async fn start_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StartResponse>> {
    let stream_url = state.radio.start_channel(&id).await?;
    Ok(Json(StartResponse { stream_url }))
}

async fn stop_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.radio.stop_channel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(tracks): Json<Vec<RadioTrack>>,
) -> ApiResult<StatusCode> {
    state.radio.set_playlist(&id, tracks)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<RadioTrack>>> {
    Ok(Json(state.radio.get_playlist(&id)?))
}

#[derive(Debug, Deserialize)]
struct AddTrackRequest {
    #[serde(flatten)]
    track: RadioTrack,
    position: Option<usize>,
}

async fn add_track(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddTrackRequest>,
) -> ApiResult<StatusCode> {
    state.radio.add_track(&id, request.track, request.position)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_track(
    State(state): State<AppState>,
    Path((id, track_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.radio.remove_track(&id, &track_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn skip_track(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.radio.skip_track(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn now_playing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<RadioTrack>>> {
    Ok(Json(state.radio.now_playing(&id)?))
}

#[derive(Debug, Deserialize)]
struct AutoDjRequest {
    enabled: bool,
    #[serde(default)]
    folders: Vec<String>,
    #[serde(default = "default_shuffle")]
    shuffle: bool,
}

fn default_shuffle() -> bool {
    true
}

async fn set_auto_dj(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AutoDjRequest>,
) -> ApiResult<StatusCode> {
    state
        .radio
        .set_auto_dj(&id, request.enabled, request.folders, request.shuffle)?;
    Ok(StatusCode::NO_CONTENT)
}
