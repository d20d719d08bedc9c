//! HTTP error mapping. Every error body carries the stable machine code plus
//! the response metadata the rest of the API uses.

use crate::core::AppError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ResponseMetadata {
    pub fn new() -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for ResponseMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub metadata: ResponseMetadata,
}

/// Wrap a payload in the standard response envelope.
pub fn envelope<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        data,
        metadata: ResponseMetadata::new(),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub metadata: ResponseMetadata,
}

#[derive(Debug)]
pub struct WebError(pub AppError);

impl From<AppError> for WebError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl WebError {
    /// Shorthand for request validation failures caught at the boundary.
    pub fn validation(message: impl Into<String>) -> Self {
        Self(AppError::Validation(message.into()))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::Validation(_)
            | AppError::InvalidDateRange(_)
            | AppError::InvalidJobType(_)
            | AppError::ForceRequired(_)
            | AppError::InvalidJobState(_)
            | AppError::CancellationFailed(_) => StatusCode::BAD_REQUEST,
            AppError::JobNotFound(_)
            | AppError::SnapshotNotFound(_)
            | AppError::AnalyticsNotFound(_) => StatusCode::NOT_FOUND,
            AppError::JobAlreadyRunning(_) | AppError::SnapshotConflict(_) => StatusCode::CONFLICT,
            AppError::Storage(_) | AppError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UnsupportedOperation(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            metadata: ResponseMetadata::new(),
        });
        (status, body).into_response()
    }
}

pub type WebResult<T> = std::result::Result<T, WebError>;
