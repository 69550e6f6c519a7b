//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use gpufleet_core::{
    CostReport, EfficiencyScore, FleetError, Gpu, GpuSpec, GpuStatus, Job, JobOutcome, JobSpec,
    JobStatus, Organization, ReportWindow,
};
use gpufleet_scheduler::{FleetStatus, Scheduler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    let state = Arc::new(AppState { scheduler });

    Router::new()
        .route("/api/v1/organizations", post(create_organization))
        .route("/api/v1/organizations", get(list_organizations))
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/complete", post(complete_job))
        .route("/api/v1/gpus", post(register_gpu))
        .route("/api/v1/gpus", get(list_gpus))
        .route("/api/v1/gpus/:id/efficiency", get(gpu_efficiency))
        .route("/api/v1/costs", get(cost_report))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a library error onto an HTTP status
pub fn error_status(err: &FleetError) -> StatusCode {
    match err {
        FleetError::Validation(_) | FleetError::Serialization(_) => StatusCode::BAD_REQUEST,
        FleetError::JobNotFound(_)
        | FleetError::GpuNotFound(_)
        | FleetError::OrganizationNotFound(_) => StatusCode::NOT_FOUND,
        FleetError::InvalidTransition { .. }
        | FleetError::Conflict(_)
        | FleetError::GpuBusy(_) => StatusCode::CONFLICT,
        FleetError::Allocation(_) | FleetError::SpotCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::Provider { .. } | FleetError::Provisioning(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: FleetError) -> (StatusCode, String) {
    (error_status(&err), err.to_string())
}

fn parse_status<T>(raw: Option<&str>) -> ApiResult<Option<T>>
where
    T: std::str::FromStr<Err = FleetError>,
{
    raw.filter(|s| !s.is_empty())
        .map(str::parse)
        .transpose()
        .map_err(reject)
}

/// Request to register an organization
#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub id: String,
    /// Display name; defaults to the id
    #[serde(default)]
    pub name: String,
}

async fn create_organization(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrganizationRequest>,
) -> ApiResult<(StatusCode, Json<Organization>)> {
    let org = state
        .scheduler
        .register_organization(&req.id, &req.name)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(org)))
}

async fn list_organizations(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Organization>>> {
    let orgs = state.scheduler.list_organizations().await.map_err(reject)?;
    Ok(Json(orgs))
}

/// Submit a job; the response reflects the sweep the submission triggered
async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    info!(
        organization = %spec.organization_id,
        model = %spec.model_name,
        "Submitting job"
    );
    let job = state.scheduler.submit_job(spec).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Filters shared by the job and GPU listings
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub organization: Option<String>,
    pub status: Option<String>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let status = parse_status::<JobStatus>(query.status.as_deref())?;
    let jobs = state
        .scheduler
        .list_jobs(query.organization.as_deref(), status)
        .await
        .map_err(reject)?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let job = state.scheduler.get_job(id).await.map_err(reject)?;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    info!(job_id = %id, "Cancelling job");
    let job = state.scheduler.cancel_job(id).await.map_err(reject)?;
    Ok(Json(job))
}

/// Outcome reported by whatever ran the job
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CompleteRequest {
    Completed {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Failed {
        error: String,
    },
}

impl From<CompleteRequest> for JobOutcome {
    fn from(req: CompleteRequest) -> Self {
        match req {
            CompleteRequest::Completed { result } => JobOutcome::Completed(result),
            CompleteRequest::Failed { error } => JobOutcome::Failed(error),
        }
    }
}

async fn complete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Json<Job>> {
    let job = state
        .scheduler
        .complete_job(id, req.into())
        .await
        .map_err(reject)?;
    Ok(Json(job))
}

async fn register_gpu(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<GpuSpec>,
) -> ApiResult<(StatusCode, Json<Gpu>)> {
    info!(
        organization = %spec.organization_id,
        name = %spec.name,
        memory = spec.total_memory,
        "Registering GPU"
    );
    let gpu = state.scheduler.register_gpu(spec).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(gpu)))
}

async fn list_gpus(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Gpu>>> {
    let status = parse_status::<GpuStatus>(query.status.as_deref())?;
    let gpus = state
        .scheduler
        .list_gpus(query.organization.as_deref(), status)
        .await
        .map_err(reject)?;
    Ok(Json(gpus))
}

/// Reporting window in hours back from now
#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub organization: Option<String>,
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

fn window(hours: i64) -> ApiResult<ReportWindow> {
    if hours <= 0 {
        return Err(reject(FleetError::Validation(
            "hours must be positive".to_string(),
        )));
    }
    Ok(ReportWindow::last_hours(hours))
}

async fn cost_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<CostReport>> {
    let organization = query.organization.ok_or_else(|| {
        reject(FleetError::Validation(
            "organization is required".to_string(),
        ))
    })?;
    let report = state
        .scheduler
        .cost_report(&organization, window(query.hours)?)
        .await
        .map_err(reject)?;
    Ok(Json(report))
}

async fn gpu_efficiency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<EfficiencyScore>> {
    let score = state
        .scheduler
        .gpu_efficiency(id, window(query.hours)?)
        .await
        .map_err(reject)?;
    Ok(Json(score))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub fleet: FleetStatus,
}

async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let fleet = state.scheduler.status().await.map_err(reject)?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        fleet,
    }))
}
