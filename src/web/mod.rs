//! Admin HTTP surface. Thin handlers: strict input validation, then a single
//! service or catalog call, then the standard response envelope.

pub mod admin;
pub mod error;
pub mod snapshots;

pub use error::{ApiResponse, ErrorBody, ResponseMetadata, WebError, WebResult, envelope};

use crate::core::{AppResult, JobFilter, RateLimitConfig, SnapshotFilter};
use crate::jobs::BackfillService;
use crate::snapshot::{IndexMaintainer, SnapshotCatalog};
use crate::storage::StorageProvider;
use crate::upstream::{AnalyticsComputer, UpstreamFetcher};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BackfillService>,
    pub catalog: Arc<SnapshotCatalog>,
    pub storage: Arc<dyn StorageProvider>,
}

impl AppState {
    /// Assemble the full stack over a storage provider. The index maintainer
    /// is shared between the job executor and the deletion cascade so
    /// per-key locking actually serializes them.
    pub async fn build(
        storage: Arc<dyn StorageProvider>,
        fetcher: Arc<dyn UpstreamFetcher>,
        analytics: Arc<dyn AnalyticsComputer>,
        rate_defaults: RateLimitConfig,
    ) -> AppResult<Self> {
        let index = Arc::new(IndexMaintainer::new(storage.clone()));
        let service = BackfillService::initialize(
            storage.clone(),
            index.clone(),
            fetcher,
            analytics,
            rate_defaults,
        )
        .await?;
        let catalog = Arc::new(SnapshotCatalog::new(storage.clone(), index));
        Ok(Self {
            service,
            catalog,
            storage,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/admin/health", get(health))
        .route("/api/admin/storage/stats", get(storage_stats))
        .route("/api/admin/backfill", post(admin::create_backfill))
        .route("/api/admin/backfill/jobs", get(admin::list_jobs))
        .route("/api/admin/backfill/preview", post(admin::preview_backfill))
        .route(
            "/api/admin/backfill/config/rate-limit",
            get(admin::get_rate_limit).put(admin::update_rate_limit),
        )
        .route(
            "/api/admin/backfill/:job_id",
            get(admin::get_job).delete(admin::cancel_job),
        )
        .route(
            "/api/admin/backfill/:job_id/force-cancel",
            post(admin::force_cancel_job),
        )
        .route(
            "/api/admin/snapshots",
            get(snapshots::list_snapshots).delete(snapshots::delete_snapshots),
        )
        .route("/api/admin/snapshots/range", delete(snapshots::delete_snapshot_range))
        .route("/api/admin/snapshots/all", delete(snapshots::delete_all_snapshots))
        .route("/api/admin/snapshots/:snapshot_id", get(snapshots::get_snapshot))
        .route(
            "/api/admin/snapshots/:snapshot_id/payload",
            get(snapshots::get_snapshot_payload),
        )
        .route(
            "/api/admin/snapshots/:snapshot_id/analytics",
            get(snapshots::get_snapshot_analytics),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    backend: &'static str,
    active_job: Option<String>,
}

async fn health(State(state): State<AppState>) -> WebResult<impl IntoResponse> {
    let active_job = state
        .service
        .list(&JobFilter::default())
        .await?
        .into_iter()
        .find(|j| j.status.is_active())
        .map(|j| j.job_id);
    Ok(envelope(Health {
        status: "ok",
        backend: state.storage.backend_name(),
        active_job,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageStats {
    backend: &'static str,
    snapshot_count: usize,
    earliest_snapshot: Option<String>,
    latest_snapshot: Option<String>,
    jobs_by_status: BTreeMap<String, usize>,
}

async fn storage_stats(State(state): State<AppState>) -> WebResult<impl IntoResponse> {
    let snapshots = state.catalog.list(&SnapshotFilter::default()).await?;
    let jobs = state.service.list(&JobFilter::default()).await?;
    let mut jobs_by_status = BTreeMap::new();
    for job in &jobs {
        *jobs_by_status.entry(job.status.to_string()).or_insert(0) += 1;
    }
    Ok(envelope(StorageStats {
        backend: state.storage.backend_name(),
        snapshot_count: snapshots.len(),
        earliest_snapshot: snapshots.first().map(|m| m.snapshot_id.clone()),
        latest_snapshot: snapshots.last().map(|m| m.snapshot_id.clone()),
        jobs_by_status,
    }))
}
