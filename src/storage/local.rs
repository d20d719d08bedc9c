//! Filesystem-backed storage.
//!
//! Layout under the base directory:
//!
//! ```text
//! snapshots/{YYYY-MM-DD}/metadata.json | manifest.json | district_{id}.json
//! analytics/{YYYY-MM-DD}.json
//! time-series/district_{id}/{YYYY-YYYY}.json
//! jobs/{job_id}.json
//! config/rate-limit.json
//! ```
//!
//! Single files are written temp-then-rename; snapshots are staged as a whole
//! directory under `snapshots/.staging/{uuid}` and committed with one rename,
//! so a reader never sees a partially written snapshot.

use crate::core::{
    AnalyticsArtifact, AppError, AppResult, JobRecord, RateLimitConfig, Snapshot, SnapshotFilter,
    SnapshotManifest, SnapshotMetadata, SnapshotStatus, TimeSeriesEntry,
};
use crate::storage::provider::{PutOutcome, StorageProvider};
use async_trait::async_trait;
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";

pub struct LocalStorageProvider {
    base_dir: PathBuf,
}

impl LocalStorageProvider {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> AppResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        for sub in ["snapshots", "analytics", "time-series", "jobs", "config"] {
            std::fs::create_dir_all(base_dir.join(sub)).map_err(|e| {
                AppError::Storage(format!("Failed to create data directory '{}': {}", sub, e))
            })?;
        }
        Ok(Self { base_dir })
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir().join(snapshot_id)
    }

    fn index_path(&self, district_id: &str, program_year: &str) -> PathBuf {
        self.base_dir
            .join("time-series")
            .join(format!("district_{}", district_id))
            .join(format!("{}.json", program_year))
    }

    fn analytics_path(&self, snapshot_id: &str) -> PathBuf {
        self.base_dir
            .join("analytics")
            .join(format!("{}.json", snapshot_id))
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.base_dir.join("jobs").join(format!("{}.json", job_id))
    }

    fn rate_limit_path(&self) -> PathBuf {
        self.base_dir.join("config").join("rate-limit.json")
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> AppResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    AppError::Storage(format!("Failed to decode {}: {}", path.display(), e))
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Write a JSON file atomically: serialize, write to a uniquely named
    /// sibling temp file, rename over the target.
    async fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> AppResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| AppError::Storage(format!("No parent for {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;
        let tmp = parent.join(format!(
            ".{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
            Uuid::new_v4()
        ));
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::Storage(format!(
                "Failed to commit {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> AppResult<PutOutcome> {
        let snapshot_id = snapshot.id().to_string();
        let final_dir = self.snapshot_dir(&snapshot_id);

        let mut outcome = PutOutcome::Created;
        if let Some(existing) = self
            .read_json::<SnapshotMetadata>(&final_dir.join("metadata.json"))
            .await?
        {
            if existing.status != SnapshotStatus::Failed {
                return Err(AppError::SnapshotConflict(snapshot_id));
            }
            outcome = PutOutcome::Replaced;
        }

        // Stage every object under a write-attempt directory, then commit
        // with a single rename.
        let staging = self
            .snapshots_dir()
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&staging).await?;

        let staged: AppResult<()> = async {
            let bytes = serde_json::to_vec_pretty(&snapshot.metadata)?;
            tokio::fs::write(staging.join("metadata.json"), bytes).await?;
            let bytes = serde_json::to_vec_pretty(&snapshot.manifest())?;
            tokio::fs::write(staging.join("manifest.json"), bytes).await?;
            for record in &snapshot.records {
                let bytes = serde_json::to_vec_pretty(record)?;
                tokio::fs::write(
                    staging.join(format!("district_{}.json", record.district_id)),
                    bytes,
                )
                .await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        if outcome == PutOutcome::Replaced {
            tokio::fs::remove_dir_all(&final_dir).await.ok();
        }

        if let Err(e) = tokio::fs::rename(&staging, &final_dir).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            // A concurrent writer got there first.
            if final_dir.exists() {
                return Err(AppError::SnapshotConflict(snapshot_id));
            }
            return Err(AppError::Storage(format!(
                "Failed to commit snapshot '{}': {}",
                snapshot_id, e
            )));
        }
        Ok(outcome)
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> AppResult<Option<Snapshot>> {
        let dir = self.snapshot_dir(snapshot_id);
        let Some(metadata) = self
            .read_json::<SnapshotMetadata>(&dir.join("metadata.json"))
            .await?
        else {
            return Ok(None);
        };
        let manifest = self
            .read_json::<SnapshotManifest>(&dir.join("manifest.json"))
            .await?
            .unwrap_or(SnapshotManifest {
                snapshot_id: snapshot_id.to_string(),
                district_ids: Vec::new(),
            });

        let mut records = Vec::with_capacity(manifest.district_ids.len());
        for district_id in &manifest.district_ids {
            // Partial snapshots may list districts whose record never landed.
            match self
                .read_json(&dir.join(format!("district_{}.json", district_id)))
                .await?
            {
                Some(record) => records.push(record),
                None => warn!(
                    "snapshot {}: manifest names district {} but its record is missing",
                    snapshot_id, district_id
                ),
            }
        }
        Ok(Some(Snapshot { metadata, records }))
    }

    async fn get_snapshot_metadata(
        &self,
        snapshot_id: &str,
    ) -> AppResult<Option<SnapshotMetadata>> {
        self.read_json(&self.snapshot_dir(snapshot_id).join("metadata.json"))
            .await
    }

    async fn list_snapshot_metadata(
        &self,
        filter: &SnapshotFilter,
    ) -> AppResult<Vec<SnapshotMetadata>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.snapshots_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == STAGING_DIR || !entry.file_type().await?.is_dir() {
                continue;
            }
            match self
                .read_json::<SnapshotMetadata>(&entry.path().join("metadata.json"))
                .await
            {
                Ok(Some(meta)) => {
                    if filter.matches(&meta) {
                        out.push(meta);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable snapshot '{}': {}", name, e),
            }
        }
        out.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> AppResult<bool> {
        let dir = self.snapshot_dir(snapshot_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::Storage(format!(
                "Failed to delete snapshot '{}': {}",
                snapshot_id, e
            ))),
        }
    }

    async fn list_districts_in_snapshot(&self, snapshot_id: &str) -> AppResult<Vec<String>> {
        let manifest = self
            .read_json::<SnapshotManifest>(&self.snapshot_dir(snapshot_id).join("manifest.json"))
            .await?;
        Ok(manifest.map(|m| m.district_ids).unwrap_or_default())
    }

    async fn read_index(
        &self,
        district_id: &str,
        program_year: &str,
    ) -> AppResult<Option<TimeSeriesEntry>> {
        self.read_json(&self.index_path(district_id, program_year))
            .await
    }

    async fn write_index(&self, entry: &TimeSeriesEntry) -> AppResult<()> {
        self.write_json_atomic(
            &self.index_path(&entry.district_id, &entry.program_year),
            entry,
        )
        .await
    }

    async fn delete_index_entry(&self, district_id: &str, program_year: &str) -> AppResult<bool> {
        match tokio::fs::remove_file(self.index_path(district_id, program_year)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_analytics(&self, artifact: &AnalyticsArtifact) -> AppResult<()> {
        self.write_json_atomic(&self.analytics_path(&artifact.snapshot_id), artifact)
            .await
    }

    async fn get_analytics(&self, snapshot_id: &str) -> AppResult<Option<AnalyticsArtifact>> {
        self.read_json(&self.analytics_path(snapshot_id)).await
    }

    async fn delete_analytics(&self, snapshot_id: &str) -> AppResult<bool> {
        match tokio::fs::remove_file(self.analytics_path(snapshot_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_job(&self, job: &JobRecord) -> AppResult<()> {
        self.write_json_atomic(&self.job_path(&job.job_id), job)
            .await
    }

    async fn get_job(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        self.read_json(&self.job_path(job_id)).await
    }

    async fn list_jobs(&self) -> AppResult<Vec<JobRecord>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.base_dir.join("jobs")).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_json::<JobRecord>(&path).await {
                Ok(Some(job)) => out.push(job),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable job file {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }

    async fn read_rate_limit_config(&self) -> AppResult<Option<RateLimitConfig>> {
        self.read_json(&self.rate_limit_path()).await
    }

    async fn write_rate_limit_config(&self, config: &RateLimitConfig) -> AppResult<()> {
        self.write_json_atomic(&self.rate_limit_path(), config).await
    }
}
