//! Runs one backfill job: plans work units, resumes past the checkpoint,
//! processes units under the rate limiter, and drives the job record through
//! its lifecycle.

use super::rate_limit::{Acquired, RateLimiter, ReleaseOutcome};
use super::store::JobStore;
use super::CancelSignal;
use crate::core::{
    AppError, AppResult, DistrictRecord, JobConfig, JobProgress, JobRecord, JobResultSummary,
    JobStatus, JobType, SnapshotError, SnapshotFilter, SnapshotStatus, UnitError, WorkUnit,
};
use crate::snapshot::{IndexMaintainer, SnapshotWriter, assemble_snapshot};
use crate::storage::StorageProvider;
use crate::upstream::{AnalyticsComputer, FetchError, UpstreamFetcher};
use chrono::NaiveDate;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{Instrument, Level, event, info_span};

/// Bounded retries per work unit before its failure is recorded and the plan
/// moves on.
const MAX_UNIT_ATTEMPTS: u32 = 3;
/// Smoothing factor for the per-unit duration average feeding the ETA.
const ETA_SMOOTHING: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// `pending -> running`.
    Fresh,
    /// `recovering -> running`, resuming from the stored checkpoint.
    Resume,
}

enum UnitOutcome {
    Fetched(DistrictRecord),
    NotAvailable,
    Exhausted { message: String, attempts: u32 },
    Cancelled,
}

/// Per-run progress bookkeeping: counters, smoothed unit duration, and the
/// monotone ETA clamp.
struct ProgressTracker {
    progress: JobProgress,
    tally: JobResultSummary,
    ewma_unit_secs: Option<f64>,
    last_eta: u64,
}

impl ProgressTracker {
    fn new(total_units: usize, already_done: usize) -> Self {
        let mut progress = JobProgress::with_total(total_units);
        progress.processed_units = already_done;
        if total_units > 0 {
            progress.percent = (already_done as f64 / total_units as f64) * 100.0;
        }
        Self {
            progress,
            tally: JobResultSummary::default(),
            ewma_unit_secs: None,
            last_eta: u64::MAX,
        }
    }

    fn on_unit_done(&mut self, elapsed_secs: f64, current: Option<String>) {
        self.progress.record_processed(current);
        let ewma = match self.ewma_unit_secs {
            Some(prev) => ETA_SMOOTHING * elapsed_secs + (1.0 - ETA_SMOOTHING) * prev,
            None => elapsed_secs,
        };
        self.ewma_unit_secs = Some(ewma);

        let remaining = self.progress.total_units - self.progress.processed_units;
        // Reported ETA never grows while the job is running.
        let eta = ((ewma * remaining as f64).ceil() as u64).min(self.last_eta);
        self.last_eta = eta;
        self.progress.eta_seconds = Some(eta);
    }
}

pub struct JobExecutor {
    store: Arc<JobStore>,
    storage: Arc<dyn StorageProvider>,
    writer: SnapshotWriter,
    index: Arc<IndexMaintainer>,
    fetcher: Arc<dyn UpstreamFetcher>,
    analytics: Arc<dyn AnalyticsComputer>,
    limiter: Arc<RateLimiter>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<JobStore>,
        storage: Arc<dyn StorageProvider>,
        index: Arc<IndexMaintainer>,
        fetcher: Arc<dyn UpstreamFetcher>,
        analytics: Arc<dyn AnalyticsComputer>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            store,
            writer: SnapshotWriter::new(storage.clone()),
            storage,
            index,
            fetcher,
            analytics,
            limiter,
        }
    }

    /// Compute the ordered plan for a job without side effects. Collection
    /// units come out in `(date asc, district asc)` order; analytics units in
    /// snapshot-id order.
    pub async fn plan(&self, job_type: JobType, config: &JobConfig) -> AppResult<Vec<WorkUnit>> {
        match job_type {
            JobType::DataCollection => self.plan_collection(config).await,
            JobType::AnalyticsGeneration => self.plan_analytics(config).await,
        }
    }

    async fn plan_collection(&self, config: &JobConfig) -> AppResult<Vec<WorkUnit>> {
        let mut districts = match &config.district_ids {
            Some(ids) => ids.clone(),
            None => self
                .fetcher
                .list_districts(config.start_date)
                .await
                .map_err(|e| AppError::Upstream(format!("district roster: {}", e)))?,
        };
        districts.sort();
        districts.dedup();

        let mut units = Vec::new();
        for date in config
            .start_date
            .iter_days()
            .take_while(|d| *d <= config.end_date)
        {
            if config.skip_existing {
                // Snapshots commit whole dates, so the skip-existing filter
                // operates at date granularity: an intact snapshot removes
                // every unit for its date.
                let snapshot_id = date.format("%Y-%m-%d").to_string();
                if let Some(meta) = self.storage.get_snapshot_metadata(&snapshot_id).await? {
                    if meta.status != SnapshotStatus::Failed {
                        continue;
                    }
                }
            }
            for district_id in &districts {
                units.push(WorkUnit::Collection {
                    date,
                    district_id: district_id.clone(),
                });
            }
        }
        Ok(units)
    }

    async fn plan_analytics(&self, config: &JobConfig) -> AppResult<Vec<WorkUnit>> {
        let filter = SnapshotFilter {
            start_date: Some(config.start_date),
            end_date: Some(config.end_date),
            ..Default::default()
        };
        let mut units = Vec::new();
        for meta in self.storage.list_snapshot_metadata(&filter).await? {
            if meta.status == SnapshotStatus::Failed {
                continue;
            }
            if config.skip_existing
                && self
                    .storage
                    .get_analytics(&meta.snapshot_id)
                    .await?
                    .is_some()
            {
                continue;
            }
            units.push(WorkUnit::Analytics {
                snapshot_id: meta.snapshot_id,
            });
        }
        Ok(units)
    }

    /// Entry point for the spawned executor task. Fatal errors transition the
    /// job to `failed`; everything else ends in a terminal state internally.
    pub async fn run(self: Arc<Self>, job_id: String, mode: StartMode, cancel: CancelSignal) {
        let span = info_span!("job.execute", job_id = %job_id, mode = ?mode);
        async {
            if let Err(e) = self.execute(&job_id, mode, &cancel).await {
                event!(Level::ERROR, error = %e, "job failed");
                let message = e.to_string();
                let result = self
                    .store
                    .transition(&job_id, JobStatus::Failed, |job| {
                        job.error = Some(message);
                        job.progress.current_item = None;
                    })
                    .await;
                if let Err(te) = result {
                    warn!("job {}: could not record failure: {}", job_id, te);
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        job_id: &str,
        mode: StartMode,
        cancel: &CancelSignal,
    ) -> AppResult<()> {
        let Some(job) = self.start(job_id, mode).await? else {
            return Ok(());
        };

        let units = self.plan(job.job_type, &job.config).await?;
        let start_index = match &job.checkpoint {
            Some(checkpoint) => {
                let floor = resume_floor(checkpoint);
                units.partition_point(|u| *u < floor)
            }
            None => 0,
        };
        info!(
            "job {}: {} units planned, starting at {}",
            job_id,
            units.len(),
            start_index
        );

        let mut tracker = ProgressTracker::new(units.len(), start_index);
        // Units behind the checkpoint were committed by a previous run of
        // this job; they count as skipped in this run's result.
        tracker.tally.skipped = start_index;
        let stored_checkpoint = job.checkpoint.clone();

        let finished = match job.job_type {
            JobType::DataCollection => {
                self.run_collection(
                    job_id,
                    &units,
                    start_index,
                    stored_checkpoint,
                    &mut tracker,
                    cancel,
                )
                .await?
            }
            JobType::AnalyticsGeneration => {
                self.run_analytics(
                    job_id,
                    &units,
                    start_index,
                    stored_checkpoint,
                    &mut tracker,
                    cancel,
                )
                .await?
            }
        };

        if finished {
            let tally = tracker.tally;
            let mut progress = tracker.progress.clone();
            progress.current_item = None;
            progress.eta_seconds = None;
            let result = self
                .store
                .transition(job_id, JobStatus::Completed, move |job| {
                    job.result = Some(tally);
                    job.progress = progress;
                })
                .await;
            match result {
                Ok(_) => info!(
                    "job {} completed: {} succeeded, {} skipped, {} failed",
                    job_id, tally.succeeded, tally.skipped, tally.failed
                ),
                // A force-cancel that landed during the final write wins.
                Err(AppError::InvalidJobState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Transition into `running`. Returns `None` when the job was cancelled
    /// before it ever got going.
    async fn start(&self, job_id: &str, mode: StartMode) -> AppResult<Option<JobRecord>> {
        match self.store.transition(job_id, JobStatus::Running, |_| {}).await {
            Ok(job) => Ok(Some(job)),
            Err(AppError::InvalidJobState(_)) => {
                match self.store.get(job_id).await? {
                    Some(job) if job.status.is_terminal() => Ok(None),
                    _ => Err(AppError::InvalidJobState(format!(
                        "job '{}' could not start ({:?})",
                        job_id, mode
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn run_collection(
        &self,
        job_id: &str,
        units: &[WorkUnit],
        start_index: usize,
        stored_checkpoint: Option<WorkUnit>,
        tracker: &mut ProgressTracker,
        cancel: &CancelSignal,
    ) -> AppResult<bool> {
        let mut current_date: Option<NaiveDate> = None;
        let mut date_records: Vec<DistrictRecord> = Vec::new();
        let mut date_errors: Vec<SnapshotError> = Vec::new();

        for (i, unit) in units.iter().enumerate().skip(start_index) {
            let WorkUnit::Collection { date, district_id } = unit else {
                return Err(AppError::Validation(
                    "analytics unit in a collection plan".into(),
                ));
            };

            // A completed date is flushed before the cancellation check so a
            // cancel landing at a date boundary still commits the finished
            // snapshot.
            if current_date.is_some() && current_date != Some(*date) {
                self.flush_date(
                    current_date.unwrap(),
                    std::mem::take(&mut date_records),
                    std::mem::take(&mut date_errors),
                    tracker,
                )
                .await?;
            }
            current_date = Some(*date);

            if cancel.is_cancelled() {
                return self.finish_cancelled(job_id).await;
            }

            let started = Instant::now();
            match self.collect_unit(*date, district_id, cancel).await {
                UnitOutcome::Fetched(record) => {
                    date_records.push(record);
                    tracker.tally.succeeded += 1;
                }
                UnitOutcome::NotAvailable => {
                    debug!("job {}: no data for {}", job_id, unit);
                    tracker.tally.skipped += 1;
                }
                UnitOutcome::Exhausted { message, attempts } => {
                    warn!(
                        "job {}: unit {} failed after {} attempts: {}",
                        job_id, unit, attempts, message
                    );
                    date_errors.push(SnapshotError {
                        district_id: Some(district_id.clone()),
                        message: message.clone(),
                    });
                    tracker.progress.errors.push(UnitError {
                        unit: unit.to_string(),
                        message,
                        attempts,
                    });
                    tracker.tally.failed += 1;
                }
                UnitOutcome::Cancelled => return self.finish_cancelled(job_id).await,
            }

            if !self
                .commit_progress(job_id, units, i, &stored_checkpoint, tracker, started)
                .await?
            {
                return Ok(false);
            }
        }

        if let Some(date) = current_date {
            self.flush_date(date, date_records, date_errors, tracker)
                .await?;
        }
        Ok(true)
    }

    /// Fetch one `(date, district)` with bounded retries. The limiter's
    /// adaptive delay is the backoff between attempts.
    async fn collect_unit(
        &self,
        date: NaiveDate,
        district_id: &str,
        cancel: &CancelSignal,
    ) -> UnitOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let token = match self.limiter.acquire(cancel).await {
                Acquired::Token(token) => token,
                Acquired::Cancelled => return UnitOutcome::Cancelled,
            };
            match self.fetcher.fetch(date, district_id).await {
                Ok(record) => {
                    self.limiter.release(token, ReleaseOutcome::Ok).await;
                    return UnitOutcome::Fetched(record);
                }
                Err(e) if e.is_retryable() => {
                    self.limiter
                        .release(token, ReleaseOutcome::RateLimitedByUpstream)
                        .await;
                    if attempts >= MAX_UNIT_ATTEMPTS {
                        return UnitOutcome::Exhausted {
                            message: e.to_string(),
                            attempts,
                        };
                    }
                }
                Err(FetchError::NotAvailable) => {
                    self.limiter.release(token, ReleaseOutcome::Ok).await;
                    return UnitOutcome::NotAvailable;
                }
                Err(e) => {
                    self.limiter.release(token, ReleaseOutcome::Ok).await;
                    return UnitOutcome::Exhausted {
                        message: e.to_string(),
                        attempts,
                    };
                }
            }
        }
    }

    /// Commit the fully collected date as a snapshot and fold it into the
    /// time-series index.
    async fn flush_date(
        &self,
        date: NaiveDate,
        records: Vec<DistrictRecord>,
        errors: Vec<SnapshotError>,
        tracker: &mut ProgressTracker,
    ) -> AppResult<()> {
        if records.is_empty() && errors.is_empty() {
            return Ok(());
        }
        let snapshot_id = date.format("%Y-%m-%d").to_string();
        let snapshot = assemble_snapshot(&snapshot_id, records, errors);
        match self.writer.write(&snapshot).await {
            Ok(_) => {
                self.index.apply_snapshot(&snapshot).await?;
                Ok(())
            }
            Err(AppError::SnapshotConflict(id)) => {
                // Existing divergent snapshot: record it, keep going.
                warn!("snapshot {} already exists with different content", id);
                tracker.progress.errors.push(UnitError {
                    unit: id.clone(),
                    message: format!("snapshot '{}' already exists with different content", id),
                    attempts: 1,
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_analytics(
        &self,
        job_id: &str,
        units: &[WorkUnit],
        start_index: usize,
        stored_checkpoint: Option<WorkUnit>,
        tracker: &mut ProgressTracker,
        cancel: &CancelSignal,
    ) -> AppResult<bool> {
        for (i, unit) in units.iter().enumerate().skip(start_index) {
            let WorkUnit::Analytics { snapshot_id } = unit else {
                return Err(AppError::Validation(
                    "collection unit in an analytics plan".into(),
                ));
            };
            if cancel.is_cancelled() {
                return self.finish_cancelled(job_id).await;
            }

            let started = Instant::now();
            let token = match self.limiter.acquire(cancel).await {
                Acquired::Token(token) => token,
                Acquired::Cancelled => return self.finish_cancelled(job_id).await,
            };
            let computed: AppResult<bool> = async {
                match self.storage.get_snapshot(snapshot_id).await? {
                    Some(snapshot) => {
                        let artifact = self.analytics.compute(&snapshot);
                        self.storage.put_analytics(&artifact).await?;
                        Ok(true)
                    }
                    // Deleted between planning and processing.
                    None => Ok(false),
                }
            }
            .await;
            self.limiter.release(token, ReleaseOutcome::Ok).await;

            match computed? {
                true => tracker.tally.succeeded += 1,
                false => tracker.tally.skipped += 1,
            }

            if !self
                .commit_progress(job_id, units, i, &stored_checkpoint, tracker, started)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Advance checkpoint and progress after unit `i`. Returns `false` when
    /// the job was force-cancelled out from under the executor.
    async fn commit_progress(
        &self,
        job_id: &str,
        units: &[WorkUnit],
        i: usize,
        stored_checkpoint: &Option<WorkUnit>,
        tracker: &mut ProgressTracker,
        started: Instant,
    ) -> AppResult<bool> {
        tracker.on_unit_done(
            started.elapsed().as_secs_f64(),
            Some(units[i].to_string()),
        );
        // While a resumed run is still behind the stored checkpoint (the
        // resume floor re-collects the checkpoint's whole date), leave the
        // checkpoint untouched so it never moves backwards.
        let next = units.get(i + 1).cloned().filter(|n| {
            stored_checkpoint
                .as_ref()
                .is_none_or(|stored| n >= stored)
        });
        match self
            .store
            .update_progress(job_id, tracker.progress.clone(), next)
            .await
        {
            Ok(_) => Ok(true),
            Err(AppError::InvalidJobState(_)) => {
                info!("job {}: terminal state reached externally, stopping", job_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_cancelled(&self, job_id: &str) -> AppResult<bool> {
        match self
            .store
            .transition(job_id, JobStatus::Cancelled, |job| {
                job.progress.current_item = None;
                job.progress.eta_seconds = None;
            })
            .await
        {
            Ok(_) => {
                info!("job {} cancelled", job_id);
                Ok(false)
            }
            // Force-cancel already moved it.
            Err(AppError::InvalidJobState(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Resume point for a stored checkpoint. Collection checkpoints round down to
/// the start of their date: a partially collected date left no snapshot, so
/// its units are re-fetched and the snapshot is rebuilt whole.
fn resume_floor(checkpoint: &WorkUnit) -> WorkUnit {
    match checkpoint {
        WorkUnit::Collection { date, .. } => WorkUnit::Collection {
            date: *date,
            district_id: String::new(),
        },
        other => other.clone(),
    }
}
