//! Incremental maintenance of the per-district, per-program-year index.

use crate::core::{
    AppResult, DataPoint, ProgramYear, Snapshot, TimeSeriesEntry, parse_snapshot_date,
};
use crate::storage::StorageProvider;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sole writer of time-series entries. Updates for the same
/// `(district, program year)` key are serialized by a per-key lock so
/// concurrent snapshot commits cannot interleave read-modify-write cycles.
pub struct IndexMaintainer {
    storage: Arc<dyn StorageProvider>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl IndexMaintainer {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, district_id: &str, program_year: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((district_id.to_string(), program_year.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fold a committed snapshot into the index: one upserted data point per
    /// district record. Returns the number of entries touched.
    pub async fn apply_snapshot(&self, snapshot: &Snapshot) -> AppResult<usize> {
        let date = snapshot.date()?;
        let program_year = ProgramYear::containing(date).label();
        let snapshot_id = snapshot.id().to_string();

        let mut touched = 0;
        for record in &snapshot.records {
            let lock = self.key_lock(&record.district_id, &program_year).await;
            let _guard = lock.lock().await;

            let mut entry = self
                .storage
                .read_index(&record.district_id, &program_year)
                .await?
                .unwrap_or_else(|| {
                    TimeSeriesEntry::new(
                        record.district_id.clone(),
                        ProgramYear::containing(date),
                    )
                });
            entry.upsert_point(DataPoint {
                snapshot_id: snapshot_id.clone(),
                membership: record.membership,
                payment_base: record.payment_base,
            });
            self.storage.write_index(&entry).await?;
            touched += 1;
        }
        Ok(touched)
    }

    /// Strip a deleted snapshot's data points out of every entry that
    /// referenced it. Returns how many points were removed. Index trouble
    /// must never block snapshot deletion, so per-entry failures are logged
    /// and skipped.
    pub async fn delete_snapshot_entries(
        &self,
        snapshot_id: &str,
        district_ids: &[String],
    ) -> usize {
        let program_year = match parse_snapshot_date(snapshot_id) {
            Ok(date) => ProgramYear::containing(date).label(),
            Err(e) => {
                warn!("index cleanup for '{}' skipped: {}", snapshot_id, e);
                return 0;
            }
        };

        let mut removed = 0;
        for district_id in district_ids {
            let lock = self.key_lock(district_id, &program_year).await;
            let _guard = lock.lock().await;

            let entry = match self.storage.read_index(district_id, &program_year).await {
                Ok(Some(entry)) => Some(entry),
                Ok(None) => {
                    warn!(
                        "index entry district_{}/{} missing during cleanup of {}",
                        district_id, program_year, snapshot_id
                    );
                    None
                }
                Err(e) => {
                    warn!(
                        "index entry district_{}/{} unreadable during cleanup of {}: {}",
                        district_id, program_year, snapshot_id, e
                    );
                    None
                }
            };
            let Some(mut entry) = entry else { continue };

            let dropped = entry.remove_snapshot(snapshot_id);
            if dropped == 0 {
                continue;
            }
            match self.storage.write_index(&entry).await {
                Ok(()) => removed += dropped,
                Err(e) => warn!(
                    "failed to rewrite index entry district_{}/{}: {}",
                    district_id, program_year, e
                ),
            }
        }
        removed
    }
}
