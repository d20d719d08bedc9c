//! Snapshot inspection and cascading deletion endpoints.

use super::AppState;
use super::error::{WebError, WebResult, envelope};
use crate::core::{AppError, SnapshotFilter, SnapshotStatus};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::NaiveDate;
use serde::Deserialize;

fn parse_date(field: &str, value: &str) -> WebResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| WebError::validation(format!("{} must be formatted YYYY-MM-DD", field)))
}

fn parse_status(value: &str) -> WebResult<SnapshotStatus> {
    match value {
        "success" => Ok(SnapshotStatus::Success),
        "partial" => Ok(SnapshotStatus::Partial),
        "failed" => Ok(SnapshotStatus::Failed),
        other => Err(WebError::validation(format!(
            "unknown snapshot status '{}'",
            other
        ))),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: Option<String>,
    pub schema_version: Option<u32>,
    pub calculation_version: Option<u32>,
    pub min_district_count: Option<usize>,
    pub limit: Option<usize>,
}

impl SnapshotsQuery {
    fn into_filter(self) -> WebResult<SnapshotFilter> {
        Ok(SnapshotFilter {
            start_date: self
                .start_date
                .as_deref()
                .map(|d| parse_date("startDate", d))
                .transpose()?,
            end_date: self
                .end_date
                .as_deref()
                .map(|d| parse_date("endDate", d))
                .transpose()?,
            status: self.status.as_deref().map(parse_status).transpose()?,
            schema_version: self.schema_version,
            calculation_version: self.calculation_version,
            min_district_count: self.min_district_count,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSnapshotsBody {
    pub snapshot_ids: Option<Vec<String>>,
    /// Per-district purges are not supported on any backend.
    pub district_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRangeBody {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmQuery {
    pub confirm: Option<String>,
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotsQuery>,
) -> WebResult<impl IntoResponse> {
    let filter = query.into_filter()?;
    let metadata = state.catalog.list(&filter).await?;
    Ok(envelope(metadata))
}

pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(snapshot_id): Path<String>,
) -> WebResult<impl IntoResponse> {
    let metadata = state.catalog.get_metadata(&snapshot_id).await?;
    Ok(envelope(metadata))
}

pub async fn get_snapshot_payload(
    State(state): State<AppState>,
    Path(snapshot_id): Path<String>,
) -> WebResult<impl IntoResponse> {
    let snapshot = state.catalog.get_payload(&snapshot_id).await?;
    Ok(envelope(snapshot))
}

pub async fn get_snapshot_analytics(
    State(state): State<AppState>,
    Path(snapshot_id): Path<String>,
) -> WebResult<impl IntoResponse> {
    // Distinguish a missing snapshot from missing analytics.
    state.catalog.get_metadata(&snapshot_id).await?;
    let artifact = state.catalog.get_analytics(&snapshot_id).await?;
    Ok(envelope(artifact))
}

pub async fn delete_snapshots(
    State(state): State<AppState>,
    Json(body): Json<DeleteSnapshotsBody>,
) -> WebResult<impl IntoResponse> {
    if body.district_id.is_some() {
        return Err(WebError(AppError::UnsupportedOperation(
            "deletion by district is not supported on any backend".into(),
        )));
    }
    let ids = body
        .snapshot_ids
        .filter(|ids| !ids.is_empty())
        .ok_or_else(|| WebError::validation("snapshotIds must be a non-empty list"))?;
    for id in &ids {
        parse_date("snapshotIds entry", id)?;
    }
    let report = state.catalog.delete_many(&ids).await?;
    Ok(envelope(report))
}

pub async fn delete_snapshot_range(
    State(state): State<AppState>,
    Json(body): Json<DeleteRangeBody>,
) -> WebResult<impl IntoResponse> {
    let start = parse_date("startDate", &body.start_date)?;
    let end = parse_date("endDate", &body.end_date)?;
    if start > end {
        return Err(WebError(AppError::InvalidDateRange(format!(
            "start {} is after end {}",
            start, end
        ))));
    }
    let report = state.catalog.delete_range(start, end).await?;
    Ok(envelope(report))
}

pub async fn delete_all_snapshots(
    State(state): State<AppState>,
    Query(query): Query<ConfirmQuery>,
) -> WebResult<impl IntoResponse> {
    if query.confirm.as_deref() != Some("true") {
        return Err(WebError(AppError::ForceRequired(
            "pass confirm=true to delete every snapshot".into(),
        )));
    }
    let report = state.catalog.delete_all().await?;
    Ok(envelope(report))
}
