//! Error types for retrieval and caching.
//!
//! ```text
//! StashError
//! ├── NotFound               -- no cache entry and nothing could be fetched
//! ├── RetryableTransport     -- network/5xx/429 after the retry budget ran out
//! ├── PermanentTransport     -- 4xx (not 429) or a body that failed validation
//! ├── CircuitOpen            -- channel is cooling down, no request was sent
//! ├── InsufficientDiskSpace  -- eviction could not make room for the write
//! ├── ManifestCorrupt        -- primary and backup manifest unreadable
//! ├── Io / Serialization     -- local filesystem and JSON failures
//! └── Config                 -- invalid configuration
//! ```
//!
//! A stale cached copy served after a failed refetch is not an error; see
//! [`crate::Retrieval::Stale`].

use docstash_core::http::RetryableError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StashError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Transient failure fetching '{key}' after {attempts}/{max_attempts} attempts \
         ({backoff_ms}ms backoff, circuit {}): {message}",
        circuit_label(.circuit_open)
    )]
    RetryableTransport {
        key: String,
        status: Option<u16>,
        message: String,
        attempts: u32,
        max_attempts: u32,
        backoff_ms: u64,
        circuit_open: bool,
    },

    #[error(
        "Permanent failure fetching '{key}' after {attempts}/{max_attempts} attempts \
         (circuit {}): {message}",
        circuit_label(.circuit_open)
    )]
    PermanentTransport {
        key: String,
        status: Option<u16>,
        message: String,
        attempts: u32,
        max_attempts: u32,
        circuit_open: bool,
    },

    #[error("Circuit breaker open for channel '{channel}', retry in {retry_in_ms}ms")]
    CircuitOpen { channel: String, retry_in_ms: u64 },

    #[error("Insufficient disk space: {message}")]
    InsufficientDiskSpace {
        required_bytes: u64,
        free_bytes: u64,
        message: String,
    },

    #[error("Manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn circuit_label(open: &bool) -> &'static str {
    if *open {
        "open"
    } else {
        "closed"
    }
}

/// Result type for docstash operations.
pub type StashResult<T> = Result<T, StashError>;

impl StashError {
    /// True for errors raised while talking to the remote source.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StashError::RetryableTransport { .. }
                | StashError::PermanentTransport { .. }
                | StashError::CircuitOpen { .. }
        )
    }

    /// HTTP status behind a transport error, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            StashError::RetryableTransport { status, .. }
            | StashError::PermanentTransport { status, .. } => *status,
            _ => None,
        }
    }

    /// Number of network attempts spent before this error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            StashError::RetryableTransport { attempts, .. }
            | StashError::PermanentTransport { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

impl RetryableError for StashError {
    fn is_retryable(&self) -> bool {
        match self {
            StashError::RetryableTransport { .. } => true,

            StashError::NotFound(_)
            | StashError::PermanentTransport { .. }
            | StashError::CircuitOpen { .. }
            | StashError::InsufficientDiskSpace { .. }
            | StashError::ManifestCorrupt(_)
            | StashError::Io(_)
            | StashError::Serialization(_)
            | StashError::Config(_) => false,
        }
    }
}
