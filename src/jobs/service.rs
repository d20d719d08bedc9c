//! Facade over job creation, cancellation, preview, rate-limit configuration,
//! and startup recovery. The admin HTTP layer talks only to this type.

use super::executor::{JobExecutor, StartMode};
use super::rate_limit::RateLimiter;
use super::store::JobStore;
use super::{CancelHandle, cancellation_pair};
use crate::core::{
    AppError, AppResult, JobConfig, JobFilter, JobRecord, JobStatus, JobType, RateLimitConfig,
    RateLimitPatch, WorkUnit,
};
use crate::snapshot::IndexMaintainer;
use crate::storage::StorageProvider;
use crate::upstream::{AnalyticsComputer, UpstreamFetcher};
use chrono::{NaiveDate, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub job_type: JobType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub district_ids: Option<Vec<String>>,
    pub skip_existing: bool,
    pub rate_limit: Option<RateLimitPatch>,
}

/// Dry-run answer: what a job with this request would process.
#[derive(Debug, Clone, Serialize)]
pub struct JobPreview {
    pub job_type: JobType,
    pub total_units: usize,
    pub estimated_duration_seconds: u64,
    pub units_by_date: BTreeMap<String, usize>,
}

pub struct BackfillService {
    store: Arc<JobStore>,
    executor: Arc<JobExecutor>,
    limiter: Arc<RateLimiter>,
    storage: Arc<dyn StorageProvider>,
    cancels: Mutex<HashMap<String, CancelHandle>>,
}

impl BackfillService {
    /// Wire up the job stack. The persisted rate-limit configuration, when
    /// present, wins over the startup defaults.
    pub async fn initialize(
        storage: Arc<dyn StorageProvider>,
        index: Arc<IndexMaintainer>,
        fetcher: Arc<dyn UpstreamFetcher>,
        analytics: Arc<dyn AnalyticsComputer>,
        defaults: RateLimitConfig,
    ) -> AppResult<Arc<Self>> {
        let config = match storage.read_rate_limit_config().await? {
            Some(persisted) => {
                persisted.validate()?;
                persisted
            }
            None => {
                defaults.validate()?;
                defaults
            }
        };
        let limiter = Arc::new(RateLimiter::new(config));
        let store = Arc::new(JobStore::new(storage.clone()));
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            storage.clone(),
            index,
            fetcher,
            analytics,
            limiter.clone(),
        ));
        Ok(Arc::new(Self {
            store,
            executor,
            limiter,
            storage,
            cancels: Mutex::new(HashMap::new()),
        }))
    }

    fn validate(&self, request: &CreateJobRequest) -> AppResult<JobConfig> {
        if request.start_date > request.end_date {
            return Err(AppError::InvalidDateRange(format!(
                "start {} is after end {}",
                request.start_date, request.end_date
            )));
        }
        if request.job_type == JobType::DataCollection
            && request.end_date >= Utc::now().date_naive()
        {
            return Err(AppError::InvalidDateRange(
                "collection end date must be before today".into(),
            ));
        }
        if let Some(patch) = &request.rate_limit {
            self.limiter.config().apply(patch)?;
        }
        Ok(JobConfig {
            start_date: request.start_date,
            end_date: request.end_date,
            district_ids: request.district_ids.clone(),
            skip_existing: request.skip_existing,
            rate_limit: request.rate_limit.clone(),
        })
    }

    /// Create a job and spawn its executor. Returns immediately with the
    /// `pending` record; at most one job may be active.
    pub async fn create(&self, request: CreateJobRequest) -> AppResult<JobRecord> {
        let config = self.validate(&request)?;
        let job_id = format!("{}-{}", request.job_type, Uuid::new_v4());
        let record = JobRecord::new(&job_id, request.job_type, config);
        let record = self.store.create(record).await?;

        // Per-job limiter overrides take effect from the next acquire.
        if let Some(patch) = &record.config.rate_limit {
            if let Ok(merged) = self.limiter.config().apply(patch) {
                self.limiter.update_config(merged);
            }
        }

        self.spawn(&job_id, StartMode::Fresh);
        Ok(record)
    }

    fn spawn(&self, job_id: &str, mode: StartMode) {
        let (handle, signal) = cancellation_pair();
        self.cancels
            .lock()
            .unwrap()
            .insert(job_id.to_string(), handle);
        let executor = self.executor.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            executor.run(job_id, mode, signal).await;
        });
    }

    /// What would be processed, without side effects.
    pub async fn preview(&self, request: CreateJobRequest) -> AppResult<JobPreview> {
        let config = self.validate(&request)?;
        let units = self.executor.plan(request.job_type, &config).await?;

        let mut units_by_date = BTreeMap::new();
        for unit in &units {
            let bucket = match unit {
                WorkUnit::Collection { date, .. } => date.format("%Y-%m-%d").to_string(),
                WorkUnit::Analytics { snapshot_id } => snapshot_id.clone(),
            };
            *units_by_date.entry(bucket).or_insert(0) += 1;
        }

        let limits = self.limiter.config();
        let per_unit_ms = (60_000_f64 / limits.max_requests_per_minute as f64)
            .max(limits.min_delay_ms as f64);
        let estimated_duration_seconds =
            ((units.len() as f64 * per_unit_ms) / 1000.0).ceil() as u64;

        Ok(JobPreview {
            job_type: request.job_type,
            total_units: units.len(),
            estimated_duration_seconds,
            units_by_date,
        })
    }

    pub async fn get(&self, job_id: &str) -> AppResult<JobRecord> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }

    pub async fn list(&self, filter: &JobFilter) -> AppResult<Vec<JobRecord>> {
        self.store.list(filter).await
    }

    /// Cooperative cancel: flags the executor, which exits at the next unit
    /// boundary. Terminal jobs cannot be cancelled.
    pub async fn cancel(&self, job_id: &str) -> AppResult<bool> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(AppError::InvalidJobState(format!(
                "job '{}' is already {}",
                job_id, job.status
            )));
        }
        let flagged = {
            let cancels = self.cancels.lock().unwrap();
            match cancels.get(job_id) {
                Some(handle) => {
                    handle.cancel();
                    true
                }
                None => false,
            }
        };
        if !flagged {
            // No executor attached (e.g. an orphaned record); cancel directly.
            warn!("job {} has no executor, cancelling in place", job_id);
            self.store
                .transition(job_id, JobStatus::Cancelled, |_| {})
                .await
                .map_err(|e| AppError::CancellationFailed(e.to_string()))?;
        }
        info!("cancellation requested for job {}", job_id);
        Ok(true)
    }

    /// Privileged cancel that transitions the record immediately, without
    /// waiting for the executor to cooperate. Any in-flight write completes
    /// but its progress is discarded.
    pub async fn force_cancel(&self, job_id: &str, operator: &str) -> AppResult<bool> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(AppError::InvalidJobState(format!(
                "job '{}' is already {}",
                job_id, job.status
            )));
        }
        self.store
            .transition(job_id, JobStatus::Cancelled, |job| {
                job.error = Some("force-cancelled by operator".to_string());
            })
            .await?;
        if let Some(handle) = self.cancels.lock().unwrap().remove(job_id) {
            handle.cancel();
        }
        warn!("job {} force-cancelled (operator: {})", job_id, operator);
        Ok(true)
    }

    pub fn get_rate_limit_config(&self) -> RateLimitConfig {
        self.limiter.config()
    }

    /// Validated partial update; the merged configuration is persisted and
    /// applies from the next acquired token.
    pub async fn update_rate_limit_config(
        &self,
        patch: &RateLimitPatch,
    ) -> AppResult<RateLimitConfig> {
        let merged = self.limiter.config().apply(patch)?;
        self.limiter.update_config(merged);
        self.storage.write_rate_limit_config(&merged).await?;
        info!("rate limit config updated: {:?}", merged);
        Ok(merged)
    }

    /// Startup recovery: any job left `running` by a dead process moves to
    /// `recovering` and is respawned from its checkpoint; orphaned `pending`
    /// jobs are started fresh. Jobs whose plan can no longer be built end up
    /// `failed` via the executor.
    pub async fn recover_on_startup(&self) -> AppResult<Vec<String>> {
        let jobs = self.store.list(&JobFilter::default()).await?;
        let mut recovered = Vec::new();
        for job in jobs {
            match job.status {
                JobStatus::Running => {
                    self.store
                        .transition(&job.job_id, JobStatus::Recovering, |_| {})
                        .await?;
                    info!("recovering orphaned running job {}", job.job_id);
                    self.spawn(&job.job_id, StartMode::Resume);
                    recovered.push(job.job_id);
                }
                JobStatus::Recovering => {
                    // Crashed mid-recovery last time; resume again.
                    info!("resuming job {} stuck in recovery", job.job_id);
                    self.spawn(&job.job_id, StartMode::Resume);
                    recovered.push(job.job_id);
                }
                JobStatus::Pending => {
                    info!("starting orphaned pending job {}", job.job_id);
                    self.spawn(&job.job_id, StartMode::Fresh);
                    recovered.push(job.job_id);
                }
                _ => {}
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageProvider;
    use crate::upstream::{MembershipAnalytics, ScriptedFetcher};
    use std::time::Duration;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn service(districts: Vec<&str>) -> (Arc<MemoryStorageProvider>, Arc<BackfillService>) {
        let storage = Arc::new(MemoryStorageProvider::new());
        let index = Arc::new(IndexMaintainer::new(storage.clone()));
        let fetcher = Arc::new(ScriptedFetcher::new(
            districts.into_iter().map(String::from).collect(),
        ));
        let svc = BackfillService::initialize(
            storage.clone(),
            index,
            fetcher,
            Arc::new(MembershipAnalytics),
            RateLimitConfig {
                max_requests_per_minute: 10_000,
                max_concurrent: 4,
                min_delay_ms: 0,
                max_delay_ms: 10,
                backoff_multiplier: 2.0,
            },
        )
        .await
        .unwrap();
        (storage, svc)
    }

    fn request(start: &str, end: &str) -> CreateJobRequest {
        CreateJobRequest {
            job_type: JobType::DataCollection,
            start_date: date(start),
            end_date: date(end),
            district_ids: Some(vec!["A".into(), "B".into()]),
            skip_existing: false,
            rate_limit: None,
        }
    }

    async fn wait_terminal(svc: &BackfillService, job_id: &str) -> JobRecord {
        for _ in 0..500 {
            let job = svc.get(job_id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached a terminal state", job_id);
    }

    #[tokio::test]
    async fn create_runs_job_to_completion() {
        let (storage, svc) = service(vec![]).await;
        let job = svc.create(request("2024-01-01", "2024-01-02")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = wait_terminal(&svc, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap().succeeded, 4);
        assert!(storage.get_snapshot("2024-01-01").await.unwrap().is_some());
        assert!(storage.get_snapshot("2024-01-02").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_inverted_and_future_ranges() {
        let (_storage, svc) = service(vec![]).await;
        let err = svc.create(request("2024-01-05", "2024-01-01")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidDateRange(_)));

        let mut req = request("2024-01-01", "2024-01-02");
        req.end_date = Utc::now().date_naive();
        let err = svc.create(req).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidDateRange(_)));
    }

    #[tokio::test]
    async fn preview_has_no_side_effects() {
        let (storage, svc) = service(vec![]).await;
        let preview = svc.preview(request("2024-01-01", "2024-01-03")).await.unwrap();
        assert_eq!(preview.total_units, 6);
        assert_eq!(preview.units_by_date.len(), 3);
        assert_eq!(preview.units_by_date["2024-01-01"], 2);
        assert!(storage.list_jobs().await.unwrap().is_empty());
        assert!(storage.get_snapshot("2024-01-01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_cancel_is_immediate() {
        let (_storage, svc) = service(vec![]).await;
        // Throttle hard so the executor is parked in acquire when we strike.
        svc.update_rate_limit_config(&RateLimitPatch {
            max_requests_per_minute: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
        let job = svc.create(request("2023-01-01", "2023-12-31")).await.unwrap();
        svc.force_cancel(&job.job_id, "tester").await.unwrap();

        // Visible as cancelled on the very next read.
        let seen = svc.get(&job.job_id).await.unwrap();
        assert_eq!(seen.status, JobStatus::Cancelled);

        let err = svc.force_cancel(&job.job_id, "tester").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidJobState(_)));
    }

    #[tokio::test]
    async fn rate_limit_updates_persist() {
        let (storage, svc) = service(vec![]).await;
        let updated = svc
            .update_rate_limit_config(&RateLimitPatch {
                max_requests_per_minute: Some(99),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.max_requests_per_minute, 99);
        assert_eq!(
            storage
                .read_rate_limit_config()
                .await
                .unwrap()
                .unwrap()
                .max_requests_per_minute,
            99
        );

        let err = svc
            .update_rate_limit_config(&RateLimitPatch {
                backoff_multiplier: Some(0.5),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
