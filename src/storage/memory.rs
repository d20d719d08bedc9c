//! In-memory storage, the test double for the provider trait.

use crate::core::{
    AnalyticsArtifact, AppError, AppResult, JobRecord, RateLimitConfig, Snapshot, SnapshotFilter,
    SnapshotMetadata, SnapshotStatus, TimeSeriesEntry,
};
use crate::storage::provider::{PutOutcome, StorageProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStorageProvider {
    snapshots: RwLock<HashMap<String, Snapshot>>,
    index: RwLock<HashMap<(String, String), TimeSeriesEntry>>,
    analytics: RwLock<HashMap<String, AnalyticsArtifact>>,
    jobs: RwLock<HashMap<String, JobRecord>>,
    rate_limit: RwLock<Option<RateLimitConfig>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> AppResult<PutOutcome> {
        let mut snapshots = self.snapshots.write().await;
        let outcome = match snapshots.get(snapshot.id()) {
            Some(existing) if existing.metadata.status != SnapshotStatus::Failed => {
                return Err(AppError::SnapshotConflict(snapshot.id().to_string()));
            }
            Some(_) => PutOutcome::Replaced,
            None => PutOutcome::Created,
        };
        snapshots.insert(snapshot.id().to_string(), snapshot.clone());
        Ok(outcome)
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> AppResult<Option<Snapshot>> {
        Ok(self.snapshots.read().await.get(snapshot_id).cloned())
    }

    async fn get_snapshot_metadata(
        &self,
        snapshot_id: &str,
    ) -> AppResult<Option<SnapshotMetadata>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(snapshot_id)
            .map(|s| s.metadata.clone()))
    }

    async fn list_snapshot_metadata(
        &self,
        filter: &SnapshotFilter,
    ) -> AppResult<Vec<SnapshotMetadata>> {
        let snapshots = self.snapshots.read().await;
        let mut out: Vec<SnapshotMetadata> = snapshots
            .values()
            .map(|s| s.metadata.clone())
            .filter(|m| filter.matches(m))
            .collect();
        out.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> AppResult<bool> {
        Ok(self.snapshots.write().await.remove(snapshot_id).is_some())
    }

    async fn list_districts_in_snapshot(&self, snapshot_id: &str) -> AppResult<Vec<String>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(snapshot_id)
            .map(|s| s.manifest().district_ids)
            .unwrap_or_default())
    }

    async fn read_index(
        &self,
        district_id: &str,
        program_year: &str,
    ) -> AppResult<Option<TimeSeriesEntry>> {
        Ok(self
            .index
            .read()
            .await
            .get(&(district_id.to_string(), program_year.to_string()))
            .cloned())
    }

    async fn write_index(&self, entry: &TimeSeriesEntry) -> AppResult<()> {
        self.index.write().await.insert(
            (entry.district_id.clone(), entry.program_year.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn delete_index_entry(&self, district_id: &str, program_year: &str) -> AppResult<bool> {
        Ok(self
            .index
            .write()
            .await
            .remove(&(district_id.to_string(), program_year.to_string()))
            .is_some())
    }

    async fn put_analytics(&self, artifact: &AnalyticsArtifact) -> AppResult<()> {
        self.analytics
            .write()
            .await
            .insert(artifact.snapshot_id.clone(), artifact.clone());
        Ok(())
    }

    async fn get_analytics(&self, snapshot_id: &str) -> AppResult<Option<AnalyticsArtifact>> {
        Ok(self.analytics.read().await.get(snapshot_id).cloned())
    }

    async fn delete_analytics(&self, snapshot_id: &str) -> AppResult<bool> {
        Ok(self.analytics.write().await.remove(snapshot_id).is_some())
    }

    async fn put_job(&self, job: &JobRecord) -> AppResult<()> {
        self.jobs
            .write()
            .await
            .insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> AppResult<Vec<JobRecord>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn read_rate_limit_config(&self) -> AppResult<Option<RateLimitConfig>> {
        Ok(*self.rate_limit.read().await)
    }

    async fn write_rate_limit_config(&self, config: &RateLimitConfig) -> AppResult<()> {
        *self.rate_limit.write().await = Some(*config);
        Ok(())
    }
}
