//! Backfill job endpoints: request validation happens here, before anything
//! reaches the service.

use super::error::{WebError, WebResult, envelope};
use super::AppState;
use crate::core::{AppError, JobFilter, JobStatus, JobType, RateLimitPatch};
use crate::jobs::CreateJobRequest;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

fn parse_date(field: &str, value: &str) -> WebResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| WebError::validation(format!("{} must be formatted YYYY-MM-DD", field)))
}

fn parse_job_type(value: &str) -> WebResult<JobType> {
    match value {
        "data-collection" => Ok(JobType::DataCollection),
        "analytics-generation" => Ok(JobType::AnalyticsGeneration),
        other => Err(WebError(AppError::InvalidJobType(other.to_string()))),
    }
}

fn parse_job_status(value: &str) -> WebResult<JobStatus> {
    match value {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        "recovering" => Ok(JobStatus::Recovering),
        other => Err(WebError::validation(format!(
            "unknown job status '{}'",
            other
        ))),
    }
}

fn require_job_id(job_id: &str) -> WebResult<()> {
    if job_id.trim().is_empty() {
        return Err(WebError::validation("job id must not be empty"));
    }
    Ok(())
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPatchBody {
    pub max_requests_per_minute: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

impl RateLimitPatchBody {
    /// Boundary bounds check; the merged config is re-validated by the
    /// service.
    fn validated(self) -> WebResult<RateLimitPatch> {
        if self.max_requests_per_minute == Some(0) {
            return Err(WebError::validation("maxRequestsPerMinute must be positive"));
        }
        if self.max_concurrent == Some(0) {
            return Err(WebError::validation("maxConcurrent must be positive"));
        }
        if let Some(m) = self.backoff_multiplier {
            if !m.is_finite() || m < 1.0 {
                return Err(WebError::validation("backoffMultiplier must be at least 1.0"));
            }
        }
        Ok(RateLimitPatch {
            max_requests_per_minute: self.max_requests_per_minute,
            max_concurrent: self.max_concurrent,
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackfillBody {
    pub job_type: String,
    pub start_date: String,
    pub end_date: String,
    pub district_ids: Option<Vec<String>>,
    #[serde(default)]
    pub skip_existing: bool,
    pub rate_limit: Option<RateLimitPatchBody>,
}

impl CreateBackfillBody {
    fn into_request(self) -> WebResult<CreateJobRequest> {
        let job_type = parse_job_type(&self.job_type)?;
        let start_date = parse_date("startDate", &self.start_date)?;
        let end_date = parse_date("endDate", &self.end_date)?;
        if let Some(ids) = &self.district_ids {
            if ids.is_empty() || ids.iter().any(|id| id.trim().is_empty()) {
                return Err(WebError::validation(
                    "districtIds must be non-empty when provided",
                ));
            }
        }
        let rate_limit = self.rate_limit.map(|p| p.validated()).transpose()?;
        Ok(CreateJobRequest {
            job_type,
            start_date,
            end_date,
            district_ids: self.district_ids,
            skip_existing: self.skip_existing,
            rate_limit,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
    pub job_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    pub force: Option<String>,
    pub operator: Option<String>,
}

#[derive(Serialize)]
struct Cancelled {
    cancelled: bool,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_backfill(
    State(state): State<AppState>,
    Json(body): Json<CreateBackfillBody>,
) -> WebResult<impl IntoResponse> {
    let request = body.into_request()?;
    let job = state.service.create(request).await?;
    Ok((StatusCode::ACCEPTED, envelope(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> WebResult<impl IntoResponse> {
    let filter = JobFilter {
        status: query.status.as_deref().map(parse_job_status).transpose()?,
        job_type: query.job_type.as_deref().map(parse_job_type).transpose()?,
        limit: query.limit,
        offset: query.offset,
    };
    let jobs = state.service.list(&filter).await?;
    Ok(envelope(jobs))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> WebResult<impl IntoResponse> {
    require_job_id(&job_id)?;
    let job = state.service.get(&job_id).await?;
    Ok(envelope(job))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> WebResult<impl IntoResponse> {
    require_job_id(&job_id)?;
    let cancelled = state.service.cancel(&job_id).await?;
    Ok(envelope(Cancelled { cancelled }))
}

pub async fn force_cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> WebResult<impl IntoResponse> {
    require_job_id(&job_id)?;
    if query.force.as_deref() != Some("true") {
        return Err(WebError(AppError::ForceRequired(
            "pass force=true to force-cancel".into(),
        )));
    }
    let operator = query.operator.as_deref().unwrap_or("unknown");
    let cancelled = state.service.force_cancel(&job_id, operator).await?;
    Ok(envelope(Cancelled { cancelled }))
}

pub async fn preview_backfill(
    State(state): State<AppState>,
    Json(body): Json<CreateBackfillBody>,
) -> WebResult<impl IntoResponse> {
    let request = body.into_request()?;
    let preview = state.service.preview(request).await?;
    Ok(envelope(preview))
}

pub async fn get_rate_limit(State(state): State<AppState>) -> WebResult<impl IntoResponse> {
    Ok(envelope(state.service.get_rate_limit_config()))
}

pub async fn update_rate_limit(
    State(state): State<AppState>,
    Json(body): Json<RateLimitPatchBody>,
) -> WebResult<impl IntoResponse> {
    let patch = body.validated()?;
    let updated = state.service.update_rate_limit_config(&patch).await?;
    Ok(envelope(updated))
}
