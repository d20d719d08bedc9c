//! Read and cascade-delete surface over stored snapshots.

use crate::core::{
    AnalyticsArtifact, AppError, AppResult, Snapshot, SnapshotFilter, SnapshotMetadata,
};
use crate::snapshot::index::IndexMaintainer;
use crate::storage::StorageProvider;
use chrono::NaiveDate;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeletionReport {
    pub requested: usize,
    pub deleted: usize,
    pub data_points_removed: usize,
}

pub struct SnapshotCatalog {
    storage: Arc<dyn StorageProvider>,
    index: Arc<IndexMaintainer>,
}

impl SnapshotCatalog {
    pub fn new(storage: Arc<dyn StorageProvider>, index: Arc<IndexMaintainer>) -> Self {
        Self { storage, index }
    }

    pub async fn list(&self, filter: &SnapshotFilter) -> AppResult<Vec<SnapshotMetadata>> {
        self.storage.list_snapshot_metadata(filter).await
    }

    pub async fn get_metadata(&self, snapshot_id: &str) -> AppResult<SnapshotMetadata> {
        self.storage
            .get_snapshot_metadata(snapshot_id)
            .await?
            .ok_or_else(|| AppError::SnapshotNotFound(snapshot_id.to_string()))
    }

    pub async fn get_payload(&self, snapshot_id: &str) -> AppResult<Snapshot> {
        self.storage
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| AppError::SnapshotNotFound(snapshot_id.to_string()))
    }

    pub async fn get_analytics(&self, snapshot_id: &str) -> AppResult<AnalyticsArtifact> {
        self.storage
            .get_analytics(snapshot_id)
            .await?
            .ok_or_else(|| AppError::AnalyticsNotFound(snapshot_id.to_string()))
    }

    /// Cascade-delete one snapshot: the snapshot itself, its analytics
    /// artefact, and every data point it contributed to the index. Deleting
    /// an absent id reports `false` without error. Index and analytics
    /// cleanup never block the deletion itself.
    pub async fn delete(&self, snapshot_id: &str) -> AppResult<(bool, usize)> {
        // Read the manifest before the snapshot disappears.
        let district_ids = self.storage.list_districts_in_snapshot(snapshot_id).await?;

        let deleted = self.storage.delete_snapshot(snapshot_id).await?;
        if !deleted {
            return Ok((false, 0));
        }

        let removed = self
            .index
            .delete_snapshot_entries(snapshot_id, &district_ids)
            .await;
        match self.storage.delete_analytics(snapshot_id).await {
            Ok(_) => {}
            Err(e) => warn!("analytics cleanup for '{}' failed: {}", snapshot_id, e),
        }
        info!(
            "deleted snapshot {} ({} index points removed)",
            snapshot_id, removed
        );
        Ok((true, removed))
    }

    pub async fn delete_many(&self, snapshot_ids: &[String]) -> AppResult<DeletionReport> {
        let mut report = DeletionReport {
            requested: snapshot_ids.len(),
            ..Default::default()
        };
        for id in snapshot_ids {
            let (deleted, removed) = self.delete(id).await?;
            if deleted {
                report.deleted += 1;
            }
            report.data_points_removed += removed;
        }
        Ok(report)
    }

    pub async fn delete_range(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> AppResult<DeletionReport> {
        let filter = SnapshotFilter {
            start_date: Some(start_date),
            end_date: Some(end_date),
            ..Default::default()
        };
        let ids: Vec<String> = self
            .list(&filter)
            .await?
            .into_iter()
            .map(|m| m.snapshot_id)
            .collect();
        self.delete_many(&ids).await
    }

    pub async fn delete_all(&self) -> AppResult<DeletionReport> {
        let ids: Vec<String> = self
            .list(&SnapshotFilter::default())
            .await?
            .into_iter()
            .map(|m| m.snapshot_id)
            .collect();
        self.delete_many(&ids).await
    }
}
