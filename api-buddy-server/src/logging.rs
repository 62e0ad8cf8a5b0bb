//! `tracing-subscriber` setup driven by the config tree's `logging` block.

use api_buddy_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. `RUST_LOG` always wins over
/// `logging.level` when set, matching the convention `tracing-subscriber`
/// itself documents.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.enable_console)
        .compact()
        .init();
}
