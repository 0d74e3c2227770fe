use std::time::Duration;

use thiserror::Error;

/// What went wrong while refreshing a reply.
///
/// The taxonomy matters for recovery: transport-shaped failures against a
/// peer trigger peer-error handling and a single origin retry; transport
/// failures against the origin fall back to stale-if-error where a usable
/// stale reply exists; everything else propagates to the caller, who
/// decides how to surface it.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BackendError {
    /// The upstream has no reply for this stem (HTTP 4xx).
    #[error("not found")]
    NotFound,
    /// The upstream refused the request (HTTP 401/403).
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The transfer did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Connection loss, DNS failure, or a 5xx upstream response.
    #[error("transfer failed: {0}")]
    Transfer(String),
    /// The transfer succeeded but the reply is unusable: inconsistent
    /// metadata, a bad validator, or a fingerprint mismatch.
    #[error("malformed reply: {0}")]
    Malformed(String),
    /// An unexpected error in this process.
    #[error("internal error")]
    InternalError,
}

impl BackendError {
    /// Squash an error chain down to its root cause for logging and for
    /// the stale-if-error decision.
    pub fn transfer_error(mut error: &dyn std::error::Error) -> Self {
        while let Some(source) = error.source() {
            error = source;
        }
        BackendError::Transfer(error.to_string())
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        tracing::error!(error = &err as &dyn std::error::Error, "i/o error");
        BackendError::InternalError
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BackendError::Timeout(Duration::ZERO);
        }
        BackendError::transfer_error(&err)
    }
}
