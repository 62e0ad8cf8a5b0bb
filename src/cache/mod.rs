//! Content-addressed persistent response cache.

mod engine;
mod key;

pub use engine::{
    CacheEngine, CacheStats, CachedResponse, ConfiguredTtlResolver, StoreOutcome, TtlResolver,
};
pub use key::derive_key;
