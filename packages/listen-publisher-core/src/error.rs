//! Centralized error taxonomy for the publisher core.
//!
//! A leaf-error-plus-classification-predicate shape: each failure mode
//! is a variant, and [`PublisherError::is_retryable`] is the single place
//! the retry engine (§4.D) consults to decide whether to keep going.

use thiserror::Error;

/// Application-wide error type for the publisher core (§7).
#[derive(Debug, Error)]
pub enum PublisherError {
    /// Connection reset, DNS failure, timeout, or 502/503/504 — always
    /// retried by the retry engine before reaching the caller.
    #[error("transient error: {0}")]
    Transient(String),

    /// HTTP 429. Never counted as an error; the governor computes a wait
    /// and the caller retries the whole batch.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Authentication was revoked or rejected (401). Terminal for the run.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A 4xx response other than 429/401. Fatal for the offending batch,
    /// not for the run — the publisher counts the batch into `error_count`
    /// and moves on.
    #[error("validation error (status {status}): {message}")]
    Validation { status: u16, message: String },

    /// Local I/O failure (disk full, permission denied, serialization
    /// failure). In-memory state stays authoritative; the run continues.
    #[error("local error: {0}")]
    Local(String),

    /// The per-call deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl PublisherError {
    /// Returns `true` if the retry engine should retry this error with
    /// backoff. 429 is excluded: it is handled by the governor, not the
    /// retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublisherError::Transient(_) | PublisherError::Timeout(_))
    }

    /// Returns `true` for the distinguished authentication failure that
    /// stops the publisher loop immediately (§4.F, fatal conditions).
    pub fn is_authentication(&self) -> bool {
        matches!(self, PublisherError::Authentication(_))
    }

    /// Classifies a raw `reqwest::Error` into the taxonomy above.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return PublisherError::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        let msg = err.to_string().to_lowercase();
        if RETRYABLE_SUBSTRINGS.iter().any(|s| msg.contains(s)) {
            PublisherError::Transient(err.to_string())
        } else {
            PublisherError::Local(err.to_string())
        }
    }

    /// Classifies an HTTP status code and response body into the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            429 => PublisherError::RateLimited { retry_after_secs: 60 },
            401 => PublisherError::Authentication(body.into()),
            502 | 503 | 504 => PublisherError::Transient(body.into()),
            400..=499 => PublisherError::Validation {
                status,
                message: body.into(),
            },
            _ => PublisherError::Local(format!("unexpected status {status}: {}", body.into())),
        }
    }
}

/// Literal substrings that mark an otherwise-unclassified error as
/// retryable (§4.D).
const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "timeout",
    "network",
    "socket hang up",
    "connection reset",
    "dns",
    "refused",
    "unreachable",
];

impl From<std::io::Error> for PublisherError {
    fn from(err: std::io::Error) -> Self {
        PublisherError::Local(err.to_string())
    }
}

impl From<serde_json::Error> for PublisherError {
    fn from(err: serde_json::Error) -> Self {
        PublisherError::Local(err.to_string())
    }
}

/// Convenience result alias for publisher-core operations.
pub type PublisherResult<T> = Result<T, PublisherError>;
