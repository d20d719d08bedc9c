use crate::core::{
    AnalyticsArtifact, AppResult, JobRecord, RateLimitConfig, Snapshot, SnapshotFilter,
    SnapshotMetadata, TimeSeriesEntry,
};
use async_trait::async_trait;

/// Outcome of an atomic snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    /// The id existed with a `failed` status and was replaced.
    Replaced,
}

/// Abstract CRUD over snapshots, time-series index entries, job records, and
/// the persisted rate-limit configuration.
///
/// Contract notes:
/// - Every write is atomic at the file/object level: a reader never observes
///   a half-written value, and a snapshot becomes visible only once all of
///   its objects are committed.
/// - Reads of a missing key return `Ok(None)` (or `false` for deletes), not
///   an error.
/// - `put_snapshot` refuses to overwrite an existing snapshot unless the
///   existing one has `status == failed`. Content-level idempotency lives a
///   layer up, in the snapshot writer.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short identifier for diagnostics ("local", "cloud", "memory").
    fn backend_name(&self) -> &'static str;

    // --- snapshots ---

    async fn put_snapshot(&self, snapshot: &Snapshot) -> AppResult<PutOutcome>;
    async fn get_snapshot(&self, snapshot_id: &str) -> AppResult<Option<Snapshot>>;
    async fn get_snapshot_metadata(&self, snapshot_id: &str)
    -> AppResult<Option<SnapshotMetadata>>;
    async fn list_snapshot_metadata(
        &self,
        filter: &SnapshotFilter,
    ) -> AppResult<Vec<SnapshotMetadata>>;
    /// Idempotent; returns whether anything was removed.
    async fn delete_snapshot(&self, snapshot_id: &str) -> AppResult<bool>;
    /// District ids named by the snapshot's manifest, empty when absent.
    async fn list_districts_in_snapshot(&self, snapshot_id: &str) -> AppResult<Vec<String>>;

    // --- time-series index ---

    async fn read_index(
        &self,
        district_id: &str,
        program_year: &str,
    ) -> AppResult<Option<TimeSeriesEntry>>;
    async fn write_index(&self, entry: &TimeSeriesEntry) -> AppResult<()>;
    async fn delete_index_entry(&self, district_id: &str, program_year: &str) -> AppResult<bool>;

    // --- analytics artefacts ---

    async fn put_analytics(&self, artifact: &AnalyticsArtifact) -> AppResult<()>;
    async fn get_analytics(&self, snapshot_id: &str) -> AppResult<Option<AnalyticsArtifact>>;
    async fn delete_analytics(&self, snapshot_id: &str) -> AppResult<bool>;

    // --- jobs ---

    async fn put_job(&self, job: &JobRecord) -> AppResult<()>;
    async fn get_job(&self, job_id: &str) -> AppResult<Option<JobRecord>>;
    async fn list_jobs(&self) -> AppResult<Vec<JobRecord>>;

    // --- configuration ---

    async fn read_rate_limit_config(&self) -> AppResult<Option<RateLimitConfig>>;
    async fn write_rate_limit_config(&self, config: &RateLimitConfig) -> AppResult<()>;
}
