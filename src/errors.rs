use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::services::swift::BackendError;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message);
        } else {
            tracing::debug!(status = %self.status, error = %self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        AppError::new(err.status(), err.to_string())
    }
}

/// Failures of the transfer engine and of the services it talks to.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed request: {0}")]
    Protocol(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("no access to container `{container}` (status {status})")]
    ContainerAccess { container: String, status: u16 },
    #[error("container `{container}` could not be created (status {status})")]
    ContainerCreate { container: String, status: u16 },
    #[error("could not list container `{container}` (status {status})")]
    Listing { container: String, status: u16 },
    #[error("source object `{container}/{object}` could not be fetched (status {status})")]
    SourceNotFound {
        container: String,
        object: String,
        status: u16,
    },
    #[error("ETag missing for `{container}/{object}`, maybe segments file empty")]
    MissingEtag { container: String, object: String },
    #[error("write of `{container}/{object}` failed with status {status}")]
    ObjectWrite {
        container: String,
        object: String,
        status: u16,
    },
    #[error("segment {segment} upload failed with status {status}")]
    SegmentWrite { segment: u64, status: u16 },
    #[error("manifest for `{object}` could not be written (status {status})")]
    ManifestWrite { object: String, status: u16 },
    #[error("storage backend timed out")]
    BackendTimeout,
    #[error("upload incomplete: {done} of {total} chunks received")]
    IncompleteUpload { done: u64, total: u64 },
    #[error("Object is already being uploaded.")]
    AlreadyUploading,
    #[error("upload cancelled")]
    Cancelled,
    #[error("upload failed: {0}")]
    JobFailed(String),
    #[error("key management error: {message}")]
    KeyManagement { status: u16, message: String },
    #[error("key management service timed out")]
    KeyManagementTimeout,
    #[error("identity service failed with status {status}")]
    Identity { status: u16 },
    #[error("archive writer failed: {0}")]
    Archive(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        Self::Backend(BackendError::from(err))
    }
}

impl TransferError {
    /// HTTP status that best describes the failure to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Protocol(_) | Self::Listing { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::ContainerAccess { .. } => StatusCode::FORBIDDEN,
            Self::SourceNotFound { .. } => StatusCode::NOT_FOUND,
            Self::MissingEtag { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BackendTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::IncompleteUpload { .. } | Self::AlreadyUploading | Self::Cancelled => {
                StatusCode::CONFLICT
            }
            Self::KeyManagement { status, .. } if *status < 500 => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::KeyManagementTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ContainerCreate { .. }
            | Self::ObjectWrite { .. }
            | Self::SegmentWrite { .. }
            | Self::ManifestWrite { .. }
            | Self::JobFailed(_)
            | Self::KeyManagement { .. }
            | Self::Identity { .. }
            | Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Archive(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller, rather than a backend, caused the failure.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}
