//! Error types for bucketsync

use thiserror::Error;

/// Result type alias for bucketsync operations
pub type Result<T> = std::result::Result<T, BucketSyncError>;

/// Main error type for bucketsync
#[derive(Error, Debug)]
pub enum BucketSyncError {
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Bucket not found: {0}")]
    NoSuchBucket(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Service error (HTTP {status}): {message}")]
    Service { status: u16, message: String },

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Cloud storage error: {0}")]
    CloudStorage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BucketSyncError {
    /// Check if error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            BucketSyncError::Throttled(_)
            | BucketSyncError::Timeout(_)
            | BucketSyncError::Unreachable(_) => true,
            BucketSyncError::Service { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors about the invocation itself (scope, credentials, bucket, backend)
    ///
    /// Any error while listing aborts a sync; outside listing these are the
    /// ones that point at the whole run rather than a single object.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BucketSyncError::InvalidScope(_)
                | BucketSyncError::Config(_)
                | BucketSyncError::NoSuchBucket(_)
                | BucketSyncError::Unauthorized(_)
                | BucketSyncError::Unreachable(_)
        )
    }

    /// Classify an HTTP status and service error code reported by the storage service
    pub fn from_status(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        match (status, code) {
            (_, Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded")) => {
                BucketSyncError::Throttled(message)
            }
            (_, Some("RequestTimeout")) => BucketSyncError::Timeout(message),
            (_, Some("NoSuchBucket")) => BucketSyncError::NoSuchBucket(message),
            (_, Some("NoSuchKey")) => BucketSyncError::NotFound(message),
            (_, Some("InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken")) => {
                BucketSyncError::Unauthorized(message)
            }
            (401, _) => BucketSyncError::Unauthorized(message),
            (403, _) => BucketSyncError::AccessDenied(message),
            (404, _) => BucketSyncError::NotFound(message),
            (429 | 503, _) => BucketSyncError::Throttled(message),
            (400, _) => BucketSyncError::InvalidRequest(message),
            (status, _) => BucketSyncError::Service { status, message },
        }
    }
}
