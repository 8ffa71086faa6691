//! Job routes.
//!
//! | Method | Path | Core operation |
//! |--------|------|----------------|
//! | POST | `/jobs` | submit |
//! | GET | `/jobs` | list |
//! | GET | `/jobs/{id}` | get |
//! | DELETE | `/jobs/{id}` | cancel |
//! | POST | `/jobs/{id}/retry` | retry |

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::routes::require_permission;
use crate::api::server::AppState;
use crate::jobs::{JobFilter, JobInfo, JobRequest, JobStatus};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/{id}", get(get_job).delete(cancel_job))
        .route("/{id}/retry", post(retry_job))
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    id: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    // Deserialize by hand so an unknown job type or malformed parameter
    // set surfaces as a validation error, not a framework rejection.
    let request: JobRequest = serde_json::from_value(body)
        .map_err(|e| crate::error::Error::validation(format!("invalid job request: {e}")))?;
    require_permission(&state, &request.tenant_id, &request.user_id, "media.jobs.submit").await?;
    let id = state.queue.submit(request)?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
    user_id: Option<String>,
    status: Option<JobStatus>,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<JobInfo>>> {
    let filter = JobFilter {
        tenant_id: query.tenant_id,
        user_id: query.user_id,
        status: query.status,
        limit: query.limit,
        offset: query.offset,
    };
    Ok(Json(state.queue.list(&filter)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobInfo>> {
    Ok(Json(state.queue.get(&id)?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobInfo>> {
    state.queue.cancel(&id)?;
    Ok(Json(state.queue.get(&id)?))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    id: String,
    parent_id: String,
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<RetryResponse>)> {
    let new_id = state.queue.retry(&id)?;
    Ok((
        StatusCode::CREATED,
        Json(RetryResponse {
            id: new_id,
            parent_id: id,
        }),
    ))
}
