use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    dto::{BatchDeleteRequest, CreateJobRequest, ListJobsQuery, MessageResponse, UpdateJobRequest},
    repo,
    repo_types::{Job, JobChanges, NewJob},
};
use crate::{auth::extractors::AuthUser, state::AppState};

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/batch-delete", post(batch_delete))
        .route(
            "/jobs/:id",
            put(update_job).patch(update_job).delete(delete_job),
        )
}

#[instrument(skip(state, query), fields(user_id = %user.id))]
pub async fn list_jobs(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, (StatusCode, String)> {
    let filter = query.into_filter().map_err(bad_request)?;
    let jobs = repo::list_by_user(&state.db, user.id, &filter)
        .await
        .map_err(internal)?;
    Ok(Json(jobs))
}

#[instrument(skip(state, body), fields(user_id = %user.id))]
pub async fn create_job(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), (StatusCode, String)> {
    let new_job = NewJob::try_from(body).map_err(bad_request)?;
    let job = repo::create(&state.db, user.id, &new_job)
        .await
        .map_err(internal)?;
    info!(job_id = %job.id, "job created");
    Ok((StatusCode::CREATED, Json(job)))
}

#[instrument(skip(state, body), fields(user_id = %user.id))]
pub async fn update_job(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateJobRequest>,
) -> Result<Json<Job>, (StatusCode, String)> {
    let changes = JobChanges::try_from(body).map_err(bad_request)?;
    match repo::update(&state.db, user.id, id, &changes)
        .await
        .map_err(internal)?
    {
        Some(job) => Ok(Json(job)),
        None => Err(not_found(id)),
    }
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn delete_job(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    if !repo::delete(&state.db, user.id, id).await.map_err(internal)? {
        return Err(not_found(id));
    }
    info!(job_id = %id, "job deleted");
    Ok(Json(MessageResponse {
        message: "Job deleted".into(),
        deleted: None,
    }))
}

#[instrument(skip(state, body), fields(user_id = %user.id, requested = body.ids.len()))]
pub async fn batch_delete(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<BatchDeleteRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    if body.ids.is_empty() {
        return Err(bad_request("ids must be non-empty".to_string()));
    }
    let deleted = repo::delete_many(&state.db, user.id, &body.ids)
        .await
        .map_err(internal)?;
    info!(deleted, "jobs batch-deleted");
    Ok(Json(MessageResponse {
        message: format!("Deleted {deleted} jobs"),
        deleted: Some(deleted),
    }))
}

// Another user's job is reported exactly like a missing one.
fn not_found(id: Uuid) -> (StatusCode, String) {
    warn!(job_id = %id, "job not found for caller");
    (StatusCode::NOT_FOUND, "Job not found".into())
}

fn bad_request(msg: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg)
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    error!(error = ?e, "job store failure");
    (StatusCode::INTERNAL_SERVER_ERROR, "Server error".into())
}
