use super::{ApiError, AppState, bearer_token};
use crate::application::consistency::ConsistencyReport;
use crate::application::worker::WorkerReport;
use crate::domain::anomaly::AnomalyRecord;
use crate::domain::context::TrustedContext;
use crate::domain::job::{Job, JobStatus};
use crate::domain::ports::JobFilter;
use crate::error::PaymentError;
use axum::Json;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

const DEFAULT_JOB_LIMIT: usize = 100;

/// A caller that presented the internal shared secret.
pub(super) struct InternalCaller(TrustedContext);

impl FromRequestParts<AppState> for InternalCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = bearer_token(&parts.headers).unwrap_or_default();
        match state.internal_context(presented, parts.uri.path()) {
            Some(ctx) => Ok(Self(ctx)),
            None => {
                warn!(path = %parts.uri.path(), "rejected internal call");
                Err(ApiError(PaymentError::AuthenticationFailure(
                    "invalid internal credentials".into(),
                )))
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct WorkerResponse {
    success: bool,
    #[serde(flatten)]
    report: WorkerReport,
}

/// `POST /internal/worker`: one poll of the queue.
pub(super) async fn run_worker(
    State(state): State<AppState>,
    InternalCaller(ctx): InternalCaller,
) -> Result<Json<WorkerResponse>, ApiError> {
    let report = state.worker.run_once(&ctx).await?;
    Ok(Json(WorkerResponse {
        success: true,
        report,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ConsistencyQuery {
    org_id: Option<String>,
    detector: Option<String>,
}

/// `POST /internal/consistency`: runs detectors over one or every
/// organization. Detector failures are reported, not raised.
pub(super) async fn run_consistency(
    State(state): State<AppState>,
    InternalCaller(ctx): InternalCaller,
    Query(query): Query<ConsistencyQuery>,
) -> Result<Json<ConsistencyReport>, ApiError> {
    let orgs = query.org_id.map(|org| vec![org]);
    let only: Vec<String> = query.detector.into_iter().collect();
    let report = state.detectors.run(&ctx, orgs, &only, Utc::now()).await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct JobsQuery {
    org_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

/// `GET /internal/jobs?status=failed&org_id=...`
pub(super) async fn list_jobs(
    State(state): State<AppState>,
    _caller: InternalCaller,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = query
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(PaymentError::ValidationError)?;
    let jobs = state
        .queue
        .list(JobFilter {
            org_id: query.org_id,
            status,
            limit: query.limit.unwrap_or(DEFAULT_JOB_LIMIT),
        })
        .await?;
    Ok(Json(jobs))
}

#[derive(Debug, Serialize)]
pub(super) struct RequeueResponse {
    id: Uuid,
    requeued: bool,
}

/// `POST /internal/jobs/{id}/requeue`: a failed job goes back to `queued`.
pub(super) async fn requeue_job(
    State(state): State<AppState>,
    _caller: InternalCaller,
    Path(id): Path<Uuid>,
) -> Result<Json<RequeueResponse>, ApiError> {
    if !state.queue.requeue_failed(id, Utc::now()).await? {
        return Err(PaymentError::ValidationError(format!("job {id} is not failed")).into());
    }
    Ok(Json(RequeueResponse { id, requeued: true }))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct AnomaliesQuery {
    org_id: Option<String>,
    #[serde(default)]
    include_resolved: bool,
}

/// `GET /internal/anomalies?org_id=...&include_resolved=true`
pub(super) async fn list_anomalies(
    State(state): State<AppState>,
    _caller: InternalCaller,
    Query(query): Query<AnomaliesQuery>,
) -> Result<Json<Vec<AnomalyRecord>>, ApiError> {
    let org_id = query
        .org_id
        .ok_or_else(|| PaymentError::ValidationError("org_id is required".into()))?;
    let anomalies = state
        .anomalies
        .list(&org_id, query.include_resolved)
        .await?;
    Ok(Json(anomalies))
}
