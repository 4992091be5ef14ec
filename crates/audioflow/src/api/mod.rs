use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use uuid::Uuid;

use crate::api::models::{
    CreateJobRequest, CreateJobResponse, ErrorBody, JobActionResponse, JobView, ListJobsQuery,
    ListJobsResponse, MetricsResponse,
};
use crate::error::JobError;
use crate::jobs::config::{estimate_duration, JobConfig, DEFAULT_ESTIMATED_DURATION};
use crate::jobs::dispatch::ExecutionBackend;
use crate::jobs::model::{JobFilter, NewJob};
use crate::jobs::store::JobStore;
use crate::notify::{JobEvent, StatusNotifier};

pub mod models;
pub mod ws;

/// The validated owner identity arrives on this header, set by the
/// identity-provider middleware in front of us.
pub const OWNER_HEADER: &str = "x-owner-id";

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
    pub notifier: Arc<StatusNotifier>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub default_queue: String,
    pub default_max_retries: i32,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/ws", get(ws::ws_handler))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn error_response(e: JobError) -> ApiError {
    let status = match &e {
        JobError::Validation(_) => StatusCode::BAD_REQUEST,
        JobError::NotFound => StatusCode::NOT_FOUND,
        JobError::InvalidTransition(_) => StatusCode::CONFLICT,
        JobError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

pub(crate) fn owner_from_headers(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: format!("missing or invalid {OWNER_HEADER} header"),
                    code: "UNAUTHORIZED".to_string(),
                }),
            )
        })
}

pub async fn create_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;

    let config = JobConfig::validate(&body.config).map_err(error_response)?;

    let estimated = match tokio::fs::metadata(&config.input_path).await {
        Ok(meta) => estimate_duration(meta.len(), &config),
        Err(_) => DEFAULT_ESTIMATED_DURATION,
    };

    let job = state
        .store
        .create(NewJob {
            owner_id: owner,
            kind: body.kind.unwrap_or_else(|| "transcription".to_string()),
            queue: body.queue.unwrap_or_else(|| state.default_queue.clone()),
            config: config.to_value(),
            max_retries: body.max_retries.unwrap_or(state.default_max_retries),
            estimated_duration: Some(estimated),
        })
        .await
        .map_err(error_response)?;

    tracing::info!(job_id = %job.id, owner = %owner, kind = %job.kind, "job created");
    state
        .notifier
        .send_to_owner(owner, &JobEvent::status(&job))
        .await;

    let job_id = job.id;
    state
        .backend
        .submit(&job)
        .await
        .map_err(error_response)?;

    Ok(Json(CreateJobResponse {
        job_id,
        estimated_duration: estimated,
    }))
}

pub async fn get_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let job = state.store.get(id, owner).await.map_err(error_response)?;
    Ok(Json(job.into()))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let jobs = state
        .store
        .list(
            owner,
            JobFilter {
                status: q.status,
                kind: q.kind,
                limit: q.limit,
            },
        )
        .await
        .map_err(error_response)?;

    Ok(Json(ListJobsResponse {
        items: jobs.into_iter().map(JobView::from).collect(),
    }))
}

pub async fn retry_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobActionResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;

    let job = state
        .store
        .reset_for_retry(id, owner)
        .await
        .map_err(error_response)?;

    tracing::info!(job_id = %id, owner = %owner, retry_count = job.retry_count, "user retry");
    state
        .notifier
        .send_to_owner(owner, &JobEvent::status(&job))
        .await;

    state.backend.submit(&job).await.map_err(error_response)?;

    let current = state.store.get(id, owner).await.map_err(error_response)?;
    Ok(Json(JobActionResponse {
        job_id: id,
        status: current.status,
    }))
}

pub async fn cancel_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobActionResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;

    let job = state.store.cancel(id, owner).await.map_err(error_response)?;

    tracing::info!(job_id = %id, owner = %owner, "job cancelled");
    state
        .notifier
        .send_to_owner(owner, &JobEvent::status(&job))
        .await;

    Ok(Json(JobActionResponse {
        job_id: id,
        status: job.status,
    }))
}

pub async fn metrics(State(state): State<ApiState>) -> Result<Json<MetricsResponse>, ApiError> {
    let jobs = state.store.status_counts().await.map_err(error_response)?;

    Ok(Json(MetricsResponse {
        now_utc: Utc::now(),
        jobs,
        active_connections: state.notifier.connection_count().await,
        active_owners: state.notifier.owner_count().await,
    }))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
