//! Errors raised while handling one connection, crossing the seam between
//! the core crate's per-component errors and an HTTP status code.

use thiserror::Error;

use api_buddy_core::{CacheError, ConfigError, SecurityError, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no upstream configured for domain: {0}")]
    NoUpstream(String),
    #[error("domain not mapped: {0}")]
    UnmappedDomain(String),
    #[error("invalid request path")]
    InvalidPath,
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl PipelineError {
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Cache(_) | PipelineError::Store(_) => 500,
            PipelineError::NoUpstream(_) => 502,
            PipelineError::UnmappedDomain(_) => 404,
            PipelineError::InvalidPath => 400,
            PipelineError::Upstream(_) => 502,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseConfig {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
