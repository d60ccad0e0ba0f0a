//! Error types and failure classification for the acquisition pipeline.
//!
//! This module defines structured errors for all transfer, cache, and
//! scheduling operations, providing context-rich error messages for
//! debugging and user feedback. [`classify_error`] maps an error into a
//! [`FailureKind`] which drives the mirror policy's retry decisions.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while acquiring a resource.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error transferring {url}: {source}")]
    Network {
        /// The location that failed to transfer.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Transfer timed out before completion.
    #[error("timeout transferring {url}")]
    Timeout {
        /// The location that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} transferring {url}")]
    HttpStatus {
        /// The location that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The transfer was cancelled by the caller.
    ///
    /// Cancellation is classified distinctly so the mirror policy never
    /// retries a cancelled item.
    #[error("transfer cancelled: {id}")]
    Cancelled {
        /// The work item identifier that was cancelled.
        id: String,
    },

    /// No registered processor accepts the work item.
    ///
    /// Terminal at the scheduler level; never retried.
    #[error("no processor accepts item: {id}")]
    NoProcessor {
        /// The work item identifier that nothing accepted.
        id: String,
    },

    /// File system error during transfer or promotion (rename, write, quota).
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Filename collision could not be resolved within the `copy-N` bound.
    #[error("could not resolve filename collision for {path}")]
    Collision {
        /// The contested destination path.
        path: PathBuf,
    },

    /// All mirrors and their retry budgets are consumed.
    #[error("all mirrors exhausted for resource: {resource_id}")]
    PolicyExhausted {
        /// The resource that can no longer be acquired.
        resource_id: String,
    },

    /// Object-store transport failure.
    #[error("store error fetching {key}: {message}")]
    Store {
        /// The store key or location that failed.
        key: String,
        /// Transport-provided failure description.
        message: String,
    },

    /// Cache metadata index failure.
    #[error("cache index error: {source}")]
    Index {
        /// The underlying database error.
        #[source]
        source: sqlx::Error,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a cancellation error for a work item.
    pub fn cancelled(id: impl Into<String>) -> Self {
        Self::Cancelled { id: id.into() }
    }

    /// Creates a missing-processor error for a work item.
    pub fn no_processor(id: impl Into<String>) -> Self {
        Self::NoProcessor { id: id.into() }
    }

    /// Creates a filesystem error.
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Creates a collision error.
    pub fn collision(path: impl Into<PathBuf>) -> Self {
        Self::Collision { path: path.into() }
    }

    /// Creates a mirrors-exhausted error.
    pub fn policy_exhausted(resource_id: impl Into<String>) -> Self {
        Self::PolicyExhausted {
            resource_id: resource_id.into(),
        }
    }

    /// Creates an object-store error.
    pub fn store(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Returns true when this error represents caller cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<sqlx::Error> for DownloadError {
    fn from(source: sqlx::Error) -> Self {
        Self::Index { source }
    }
}

/// Classification of a failure for mirror-policy retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Caller-initiated cancellation; never retried.
    Cancelled,

    /// Temporary failure that may succeed against the same mirror.
    ///
    /// Examples: network timeout, connection reset, 5xx server errors.
    Transient,

    /// Failure that won't succeed against the same mirror.
    ///
    /// Examples: 404 Not Found, TLS misconfiguration, filesystem errors.
    /// The policy still advances to remaining mirrors.
    Permanent,
}

/// Classifies an error for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Kind | Rationale |
/// |--------|------|-----------|
/// | 408 | Transient | Request timeout - may succeed |
/// | 429 | Transient | Rate limited - may succeed later |
/// | 4xx | Permanent | Client error - same request won't succeed |
/// | 5xx | Transient | Server error - may be temporary |
///
/// # Non-HTTP Errors
///
/// Timeouts and most network errors are transient; TLS/certificate errors,
/// filesystem errors, collisions, store errors, and exhausted policies are
/// permanent. Cancellation is its own kind so it is never retried.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureKind {
    match error {
        DownloadError::Cancelled { .. } => FailureKind::Cancelled,

        DownloadError::Timeout { .. } => FailureKind::Transient,

        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureKind::Permanent
            } else {
                FailureKind::Transient
            }
        }

        DownloadError::NoProcessor { .. }
        | DownloadError::Filesystem { .. }
        | DownloadError::Collision { .. }
        | DownloadError::PolicyExhausted { .. }
        | DownloadError::Index { .. } => FailureKind::Permanent,

        // Store failures are opaque; the retry budget bounds repeats.
        DownloadError::Store { .. } => FailureKind::Transient,
    }
}

/// Classifies an HTTP status code into a failure kind.
fn classify_http_status(status: u16) -> FailureKind {
    match status {
        408 | 429 => FailureKind::Transient,
        status if (400..500).contains(&status) => FailureKind::Permanent,
        status if (500..600).contains(&status) => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
