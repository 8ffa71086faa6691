//! TV channel routes.
//!
//! Nested under `/tv`; channels live at `/tv/channels`, the EPG at
//! `/tv/epg` and `/tv/epg.xml`.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::routes::require_permission;
use crate::api::server::AppState;
use crate::tv::{
    Bumpers, CommercialConfig, EpgEntry, TvChannelConfig, TvChannelStatus, TvProgram,
    TvScheduleEntry, TvStreamUrls,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/channels", post(create_channel).get(list_channels))
        .route(
            "/channels/{id}",
            get(channel_status).put(update_channel).delete(delete_channel),
        )
        .route("/channels/{id}/start", post(start_channel))
        .route("/channels/{id}/stop", post(stop_channel))
        .route("/channels/{id}/schedule", put(set_schedule).get(get_schedule))
        .route("/channels/{id}/programs", post(add_program))
        .route(
            "/channels/{id}/programs/{program_id}",
            axum::routing::delete(remove_program),
        )
        .route("/channels/{id}/now-playing", get(now_playing))
        .route("/channels/{id}/next", get(next_program))
        .route("/channels/{id}/bumpers", put(set_bumpers))
        .route("/channels/{id}/commercials", put(set_commercials))
        .route("/channels/{id}/epg", get(channel_epg))
        .route("/epg", get(full_epg))
        .route("/epg.xml", get(xmltv))
}

#[derive(Debug, Serialize)]
struct CreateResponse {
    id: String,
}

async fn create_channel(
    State(state): State<AppState>,
    Json(config): Json<TvChannelConfig>,
) -> ApiResult<(StatusCode, Json<CreateResponse>)> {
    require_permission(&state, &config.tenant_id, "", "media.tv.manage").await?;
    let id = state.tv.create_channel(config)?;
    Ok((StatusCode::CREATED, Json(CreateResponse { id })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
}

async fn list_channels(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<TvChannelStatus>>> {
    Ok(Json(state.tv.list_channels(query.tenant_id.as_deref())))
}

async fn channel_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TvChannelStatus>> {
    Ok(Json(state.tv.channel_status(&id)?))
}

async fn update_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<TvChannelConfig>,
) -> ApiResult<StatusCode> {
    state.tv.update_channel(&id, config)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.tv.delete_channel(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TvStreamUrls>> {
    Ok(Json(state.tv.start_channel(&id).await?))
}

async fn stop_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.tv.stop_channel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(entries): Json<Vec<TvScheduleEntry>>,
) -> ApiResult<StatusCode> {
    state.tv.set_schedule(&id, entries)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ScheduleQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ScheduleQuery>,
) -> ApiResult<Json<Vec<TvScheduleEntry>>> {
    Ok(Json(state.tv.get_schedule(&id, query.start, query.end)?))
}

async fn add_program(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(entry): Json<TvScheduleEntry>,
) -> ApiResult<StatusCode> {
    state.tv.add_program(&id, entry)?;
    Ok(StatusCode::CREATED)
}

async fn remove_program(
    State(state): State<AppState>,
    Path((id, program_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.tv.remove_program(&id, &program_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn now_playing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<TvProgram>>> {
    Ok(Json(state.tv.now_playing(&id)?))
}

async fn next_program(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<TvProgram>>> {
    Ok(Json(state.tv.next_program(&id)?))
}

async fn set_bumpers(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(bumpers): Json<Bumpers>,
) -> ApiResult<StatusCode> {
    state.tv.set_bumpers(&id, bumpers)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_commercials(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(commercials): Json<CommercialConfig>,
) -> ApiResult<StatusCode> {
    state.tv.set_commercials(&id, commercials)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EpgQuery {
    #[serde(default = "default_hours")]
    hours: u32,
}

fn default_hours() -> u32 {
    24
}

async fn channel_epg(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EpgQuery>,
) -> ApiResult<Json<Vec<EpgEntry>>> {
    Ok(Json(state.tv.generate_channel_epg(&id, query.hours)?))
}

async fn full_epg(
    State(state): State<AppState>,
    Query(query): Query<EpgQuery>,
) -> ApiResult<Json<Vec<EpgEntry>>> {
    Ok(Json(state.tv.generate_epg(query.hours)))
}

async fn xmltv(
    State(state): State<AppState>,
    Query(query): Query<EpgQuery>,
) -> impl IntoResponse {
    let xml = state.tv.export_xmltv(query.hours);
    ([(header::CONTENT_TYPE, "application/xml")], xml)
}
