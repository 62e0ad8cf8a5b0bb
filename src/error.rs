//! Per-component error types.
//!
//! Each component that can fail exposes its own [`thiserror`] enum rather
//! than sharing one crate-wide error type; `PipelineError` (in the server
//! crate) wraps these at the seam where they cross into request handling.

use thiserror::Error;

/// Errors raised by [`crate::cache::CacheEngine`] and [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("response body exceeds max_cache_response_size")]
    TooLarge,
    #[error("failed to serialize cached headers: {0}")]
    HeaderEncode(#[from] serde_json::Error),
}

/// Errors raised by [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("contention retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Errors raised by [`crate::security::SecurityGate`] configuration.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("failed to generate a secure key: {0}")]
    KeyGeneration(String),
}

/// Errors raised while loading or validating a [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path} as JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
