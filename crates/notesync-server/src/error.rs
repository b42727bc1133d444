//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use notesync_core::SyncError;
use serde::Serialize;

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Caller identity required")]
    Unauthenticated,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Sync(err) => match err {
                SyncError::LockConflict { .. } => StatusCode::CONFLICT,
                SyncError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                SyncError::NotFound(_) => StatusCode::NOT_FOUND,
                SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                SyncError::Network(_) => StatusCode::BAD_GATEWAY,
                SyncError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
                SyncError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                SyncError::Serialization(_) => StatusCode::BAD_REQUEST,
                SyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Sync(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
        }

        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };

        (self.status(), axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
