pub mod error;
pub mod types;

pub use error::{AppError, AppResult};
pub use types::{
    AnalyticsArtifact, DataPoint, DistrictAnalytics, DistrictRecord, JobConfig, JobFilter,
    JobProgress, JobRecord, JobResultSummary, JobStatus, JobType, ProgramYear, RateLimitConfig,
    RateLimitPatch, SeriesSummary, Snapshot, SnapshotError, SnapshotFilter, SnapshotManifest,
    SnapshotMetadata, SnapshotStatus, TimeSeriesEntry, UnitError, WorkUnit, parse_snapshot_date,
};
