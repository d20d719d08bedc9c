use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("Invalid job type: {0}")]
    InvalidJobType(String),

    #[error("Destructive operation requires explicit confirmation: {0}")]
    ForceRequired(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Another job is already active: {0}")]
    JobAlreadyRunning(String),

    #[error("Invalid job state transition: {0}")]
    InvalidJobState(String),

    #[error("Cancellation failed: {0}")]
    CancellationFailed(String),

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("Snapshot '{0}' already exists with different content")]
    SnapshotConflict(String),

    #[error("Analytics for snapshot '{0}' not found")]
    AnalyticsNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl AppError {
    /// Stable machine code carried alongside the human message on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidDateRange(_) => "INVALID_DATE_RANGE",
            AppError::InvalidJobType(_) => "INVALID_JOB_TYPE",
            AppError::ForceRequired(_) => "FORCE_REQUIRED",
            AppError::JobNotFound(_) => "JOB_NOT_FOUND",
            AppError::JobAlreadyRunning(_) => "JOB_ALREADY_RUNNING",
            AppError::InvalidJobState(_) => "INVALID_JOB_STATE",
            AppError::CancellationFailed(_) => "CANCELLATION_FAILED",
            AppError::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            AppError::SnapshotConflict(_) => "SNAPSHOT_CONFLICT",
            AppError::AnalyticsNotFound(_) => "ANALYTICS_NOT_FOUND",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
        }
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
