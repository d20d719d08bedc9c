//! Durable job records and the lifecycle state machine.

use crate::core::{
    AppError, AppResult, JobFilter, JobProgress, JobRecord, JobStatus, WorkUnit,
};
use crate::storage::StorageProvider;
use chrono::Utc;
use log::info;
use std::sync::Arc;
use tokio::sync::Mutex;

fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Failed)
            | (Pending, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Recovering)
            | (Recovering, Running)
            | (Recovering, Failed)
            | (Recovering, Cancelled)
    )
}

/// Single writer over job state. Every mutation runs under one store-wide
/// lock, which is also what makes the "at most one active job" invariant
/// race-free between create and startup recovery.
pub struct JobStore {
    storage: Arc<dyn StorageProvider>,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    async fn active_job(&self, excluding: &str) -> AppResult<Option<JobRecord>> {
        Ok(self
            .storage
            .list_jobs()
            .await?
            .into_iter()
            .find(|j| j.job_id != excluding && j.status.is_active()))
    }

    /// Persist a new `pending` job. Fails with `JOB_ALREADY_RUNNING` when any
    /// other job is still active.
    pub async fn create(&self, job: JobRecord) -> AppResult<JobRecord> {
        let _guard = self.lock.lock().await;
        if job.status != JobStatus::Pending {
            return Err(AppError::Validation(format!(
                "new job '{}' must start pending, got {}",
                job.job_id, job.status
            )));
        }
        if self.storage.get_job(&job.job_id).await?.is_some() {
            return Err(AppError::Validation(format!(
                "job '{}' already exists",
                job.job_id
            )));
        }
        if let Some(active) = self.active_job(&job.job_id).await? {
            return Err(AppError::JobAlreadyRunning(active.job_id));
        }
        self.storage.put_job(&job).await?;
        info!("created {} job {}", job.job_type, job.job_id);
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        self.storage.get_job(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> AppResult<Vec<JobRecord>> {
        let mut jobs = self.storage.list_jobs().await?;
        jobs.retain(|j| {
            filter.status.is_none_or(|s| j.status == s)
                && filter.job_type.is_none_or(|t| j.job_type == t)
        });
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.unwrap_or(0);
        let jobs = jobs.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => jobs.take(limit).collect(),
            None => jobs.collect(),
        })
    }

    /// Move a job to `to`, applying `mutate` to the record under the lock.
    /// Terminal states have no outgoing edges; anything outside the state
    /// machine fails loudly.
    pub async fn transition(
        &self,
        job_id: &str,
        to: JobStatus,
        mutate: impl FnOnce(&mut JobRecord) + Send,
    ) -> AppResult<JobRecord> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?;

        if !transition_allowed(job.status, to) {
            return Err(AppError::InvalidJobState(format!(
                "job '{}': {} -> {}",
                job_id, job.status, to
            )));
        }
        // Defense in depth: no legal edge enters the active set from outside
        // it, but the invariant is still re-checked here.
        if to.is_active() && !job.status.is_active() {
            if let Some(active) = self.active_job(job_id).await? {
                return Err(AppError::JobAlreadyRunning(active.job_id));
            }
        }

        let now = Utc::now();
        match to {
            JobStatus::Running => {
                if job.status == JobStatus::Recovering {
                    job.resumed_at = Some(now);
                } else if job.started_at.is_none() {
                    job.started_at = Some(now);
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                job.completed_at = Some(now);
            }
            _ => {}
        }
        let from = job.status;
        job.status = to;
        mutate(&mut job);
        self.storage.put_job(&job).await?;
        info!("job {}: {} -> {}", job_id, from, to);
        Ok(job)
    }

    /// Executor-side progress write. Only legal while the job is running;
    /// the checkpoint may only move forward in plan order.
    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: JobProgress,
        checkpoint: Option<WorkUnit>,
    ) -> AppResult<JobRecord> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Running {
            return Err(AppError::InvalidJobState(format!(
                "job '{}' is {}, not running",
                job_id, job.status
            )));
        }
        if let Some(next) = checkpoint {
            if let Some(current) = &job.checkpoint {
                if next < *current {
                    return Err(AppError::InvalidJobState(format!(
                        "job '{}': checkpoint would regress from {} to {}",
                        job_id, current, next
                    )));
                }
            }
            job.checkpoint = Some(next);
        }
        job.progress = progress;
        self.storage.put_job(&job).await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobConfig, JobType};
    use crate::storage::MemoryStorageProvider;
    use chrono::NaiveDate;

    fn config() -> JobConfig {
        JobConfig {
            start_date: NaiveDate::parse_from_str("2024-01-01", "%Y-%m-%d").unwrap(),
            end_date: NaiveDate::parse_from_str("2024-01-03", "%Y-%m-%d").unwrap(),
            district_ids: None,
            skip_existing: false,
            rate_limit: None,
        }
    }

    fn store() -> JobStore {
        JobStore::new(Arc::new(MemoryStorageProvider::new()))
    }

    fn unit(date: &str, district: &str) -> WorkUnit {
        WorkUnit::Collection {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            district_id: district.to_string(),
        }
    }

    #[tokio::test]
    async fn second_active_job_is_rejected() {
        let store = store();
        store
            .create(JobRecord::new("a", JobType::DataCollection, config()))
            .await
            .unwrap();

        let err = store
            .create(JobRecord::new("b", JobType::DataCollection, config()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::JobAlreadyRunning(id) if id == "a"));

        // Once the first job is terminal, creation works again.
        store
            .transition("a", JobStatus::Running, |_| {})
            .await
            .unwrap();
        store
            .transition("a", JobStatus::Completed, |_| {})
            .await
            .unwrap();
        store
            .create(JobRecord::new("b", JobType::DataCollection, config()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_states_have_no_outgoing_edges() {
        let store = store();
        store
            .create(JobRecord::new("a", JobType::DataCollection, config()))
            .await
            .unwrap();
        store
            .transition("a", JobStatus::Running, |_| {})
            .await
            .unwrap();
        store
            .transition("a", JobStatus::Cancelled, |_| {})
            .await
            .unwrap();

        for target in [JobStatus::Running, JobStatus::Completed, JobStatus::Pending] {
            let err = store.transition("a", target, |_| {}).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidJobState(_)));
        }
    }

    #[tokio::test]
    async fn lifecycle_timestamps_are_stamped() {
        let store = store();
        store
            .create(JobRecord::new("a", JobType::DataCollection, config()))
            .await
            .unwrap();
        let running = store
            .transition("a", JobStatus::Running, |_| {})
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let recovering = store
            .transition("a", JobStatus::Recovering, |_| {})
            .await
            .unwrap();
        assert!(recovering.resumed_at.is_none());

        let resumed = store
            .transition("a", JobStatus::Running, |_| {})
            .await
            .unwrap();
        assert!(resumed.resumed_at.is_some());

        let done = store
            .transition("a", JobStatus::Completed, |_| {})
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn checkpoint_cannot_regress() {
        let store = store();
        store
            .create(JobRecord::new("a", JobType::DataCollection, config()))
            .await
            .unwrap();
        store
            .transition("a", JobStatus::Running, |_| {})
            .await
            .unwrap();

        store
            .update_progress("a", JobProgress::with_total(6), Some(unit("2024-01-02", "A")))
            .await
            .unwrap();
        let err = store
            .update_progress("a", JobProgress::with_total(6), Some(unit("2024-01-01", "B")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidJobState(_)));
    }

    #[tokio::test]
    async fn progress_updates_require_running() {
        let store = store();
        store
            .create(JobRecord::new("a", JobType::DataCollection, config()))
            .await
            .unwrap();
        let err = store
            .update_progress("a", JobProgress::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidJobState(_)));
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = store();
        store
            .create(JobRecord::new("a", JobType::DataCollection, config()))
            .await
            .unwrap();
        store
            .transition("a", JobStatus::Running, |_| {})
            .await
            .unwrap();
        store
            .transition("a", JobStatus::Completed, |_| {})
            .await
            .unwrap();
        store
            .create(JobRecord::new("b", JobType::AnalyticsGeneration, config()))
            .await
            .unwrap();

        let completed = store
            .list(&JobFilter {
                status: Some(JobStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job_id, "a");

        let paged = store
            .list(&JobFilter {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }
}
