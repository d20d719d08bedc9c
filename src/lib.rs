// ============================================================================
// diststats Library
// ============================================================================

pub mod config;
pub mod core;
pub mod jobs;
pub mod snapshot;
pub mod storage;
pub mod upstream;
pub mod web;

// Re-export main types for convenience
pub use config::{AppConfig, StorageBackend};
pub use core::{
    AnalyticsArtifact, AppError, AppResult, DataPoint, DistrictRecord, JobConfig, JobFilter,
    JobProgress, JobRecord, JobResultSummary, JobStatus, JobType, ProgramYear, RateLimitConfig,
    RateLimitPatch, SeriesSummary, Snapshot, SnapshotError, SnapshotFilter, SnapshotMetadata,
    SnapshotStatus, TimeSeriesEntry, WorkUnit,
};
pub use jobs::{
    BackfillService, CancelHandle, CancelSignal, CreateJobRequest, JobExecutor, JobPreview,
    JobStore, RateLimiter, StartMode, cancellation_pair,
};
pub use snapshot::{
    DeletionReport, IndexMaintainer, SnapshotCatalog, SnapshotWriter, WriteOutcome,
    assemble_snapshot,
};
pub use storage::{
    CloudStorageProvider, LocalStorageProvider, MemoryStorageProvider, PutOutcome, StorageProvider,
};
pub use upstream::{
    AnalyticsComputer, DashboardFetcher, FetchError, MembershipAnalytics, ScriptedFetcher,
    UpstreamFetcher,
};
pub use web::{AppState, router};
