//! Idempotent snapshot writes on top of the storage provider's atomic put.

use crate::core::{
    AppError, AppResult, DistrictRecord, Snapshot, SnapshotError, SnapshotMetadata, SnapshotStatus,
    parse_snapshot_date,
};
use crate::storage::{PutOutcome, StorageProvider};
use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;

/// Current on-disk schema for snapshot payloads.
pub const SCHEMA_VERSION: u32 = 1;
/// Version of the derived-analytics calculations.
pub const CALCULATION_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The id already held identical content; nothing was touched.
    Unchanged,
    /// A previous `failed` snapshot under the same id was replaced.
    Replaced,
}

/// Assemble a snapshot from a collection pass. Status derivation: every
/// district landed -> `success`; some landed -> `partial`; none -> `failed`.
pub fn assemble_snapshot(
    snapshot_id: &str,
    records: Vec<DistrictRecord>,
    errors: Vec<SnapshotError>,
) -> Snapshot {
    let status = if records.is_empty() {
        SnapshotStatus::Failed
    } else if errors.is_empty() {
        SnapshotStatus::Success
    } else {
        SnapshotStatus::Partial
    };
    Snapshot {
        metadata: SnapshotMetadata {
            snapshot_id: snapshot_id.to_string(),
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
            calculation_version: CALCULATION_VERSION,
            status,
            errors,
            district_count: records.len(),
        },
        records,
    }
}

pub struct SnapshotWriter {
    storage: Arc<dyn StorageProvider>,
}

impl SnapshotWriter {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    /// Write a snapshot. Re-writing identical content is a no-op; divergent
    /// content for an existing non-`failed` id is rejected as a conflict.
    pub async fn write(&self, snapshot: &Snapshot) -> AppResult<WriteOutcome> {
        let snapshot_id = snapshot.id().to_string();
        parse_snapshot_date(&snapshot_id)?;
        if snapshot.metadata.district_count != snapshot.records.len() {
            return Err(AppError::Validation(format!(
                "snapshot '{}' metadata counts {} districts but carries {} records",
                snapshot_id,
                snapshot.metadata.district_count,
                snapshot.records.len()
            )));
        }

        if let Some(existing) = self.storage.get_snapshot(&snapshot_id).await? {
            if existing.metadata.status != SnapshotStatus::Failed {
                if existing.same_content(snapshot) {
                    debug!("snapshot {} unchanged, skipping write", snapshot_id);
                    return Ok(WriteOutcome::Unchanged);
                }
                return Err(AppError::SnapshotConflict(snapshot_id));
            }
        }

        match self.storage.put_snapshot(snapshot).await? {
            PutOutcome::Created => {
                info!(
                    "wrote snapshot {} ({} districts, status {:?})",
                    snapshot_id,
                    snapshot.records.len(),
                    snapshot.metadata.status
                );
                Ok(WriteOutcome::Written)
            }
            PutOutcome::Replaced => {
                info!("replaced failed snapshot {}", snapshot_id);
                Ok(WriteOutcome::Replaced)
            }
        }
    }
}
