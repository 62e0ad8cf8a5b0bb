//! Core engine for a caching, rate-limiting HTTP forward proxy.
//!
//! This crate holds every component that doesn't need a socket: response
//! caching, per-domain throttling, the shared-secret security gate, the
//! SQLite-backed store they all sit on, configuration loading, and the
//! read-only monitoring facade. The `api-buddy-server` crate wires these
//! together behind a thread-per-connection listener.

pub mod cache;
pub mod config;
pub mod error;
pub mod headers;
pub mod monitoring;
pub mod security;
pub mod store;
pub mod throttle;

pub use cache::{CacheEngine, CacheStats, CachedResponse, ConfiguredTtlResolver, StoreOutcome};
pub use config::Config;
pub use error::{CacheError, ConfigError, SecurityError, StoreError};
pub use headers::HeaderMap;
pub use monitoring::MonitoringFacade;
pub use security::SecurityGate;
pub use store::Store;
pub use throttle::{ThrottleDecision, ThrottleManager};
