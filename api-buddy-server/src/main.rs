//! Process entry point: CLI parsing, config loading, and component wiring.
//!
//! Construction order follows the dependency graph exactly: Store →
//! CacheEngine → ThrottleManager → SecurityGate → MonitoringFacade →
//! Pipeline → Server. Each component takes only read-only or owned
//! interfaces of its dependencies, never a back-pointer to its owner.

use std::collections::HashMap;
use std::sync::Arc;

use api_buddy_core::config::Config;
use api_buddy_core::{CacheEngine, ConfiguredTtlResolver, SecurityGate, Store, ThrottleManager};
use api_buddy_server::admin::AdminRateLimiter;
use api_buddy_server::error::StartupError;
use api_buddy_server::pipeline::Pipeline;
use api_buddy_server::{logging, server};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "api-buddy", version, about = "Caching, rate-limiting HTTP forward proxy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Raise the default tracing filter level (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Lower the default tracing filter level.
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy server (the default when no subcommand is given).
    Serve {
        #[arg(long)]
        config: Option<std::path::PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the default configuration as pretty JSON and exit.
    GenerateConfig,
}

fn main() {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve { config: None, host: None, port: None }) {
        Command::GenerateConfig => generate_config(),
        Command::Serve { config, host, port } => {
            if let Err(e) = serve(config, host, port, cli.verbose, cli.quiet) {
                eprintln!("Error starting proxy: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn generate_config() {
    let default = serde_json::to_value(Config::default()).expect("Config::default always serializes");
    println!("{}", serde_json::to_string_pretty(&default).expect("JSON value always serializes"));
}

fn serve(
    config_path: Option<std::path::PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    verbose: u8,
    quiet: bool,
) -> Result<(), StartupError> {
    let user_config = match &config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|source| StartupError::ReadConfig { path: path.display().to_string(), source })?;
            serde_json::from_str(&text)
                .map_err(|source| StartupError::ParseConfig { path: path.display().to_string(), source })?
        }
        None => serde_json::json!({}),
    };

    let mut config = Config::load_merged(user_config)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate().map_err(|errs| api_buddy_core::ConfigError::Invalid(errs.join("; ")))?;

    if verbose > 0 {
        config.logging.level = match verbose {
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
    } else if quiet {
        config.logging.level = "warn".to_string();
    }
    logging::init(&config.logging);

    let config = Arc::new(config);
    let store = Arc::new(Store::open(&config.cache.database_path)?);

    let ttl_overrides: HashMap<String, u64> = config
        .domain_mappings
        .iter()
        .filter_map(|(name, mapping)| mapping.ttl_seconds.map(|ttl| (name.clone(), ttl)))
        .collect();
    let cache = Arc::new(CacheEngine::new(
        store.clone(),
        &config.cache,
        ConfiguredTtlResolver { default_ttl_seconds: config.cache.default_ttl_seconds, overrides: ttl_overrides },
    ));

    let throttle = Arc::new(ThrottleManager::new(
        config.throttling.default_requests_per_hour,
        config.throttling.progressive_max_delay,
        config.throttling.domain_limits.clone(),
    ));

    let security = Arc::new(SecurityGate::new(config.security.require_secure_key, config.security.secure_key.clone())?);
    if config.security.require_secure_key && config.security.secure_key.is_none() {
        info!("Generated security key: {}", security_key_hint(&security));
    }

    let monitoring_cache: Arc<dyn api_buddy_core::monitoring::CacheStatsSource> = cache.clone();
    let monitoring = Arc::new(api_buddy_core::MonitoringFacade::new(
        monitoring_cache,
        throttle.clone(),
        store.clone(),
        &config,
    ));

    let admin_limiter = Arc::new(AdminRateLimiter::new());

    let pipeline = Arc::new(Pipeline {
        config: config.clone(),
        cache,
        throttle,
        security,
        store,
        monitoring,
        admin_limiter,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let server = Arc::new(
        server::Server::bind(&addr, pipeline).map_err(|source| StartupError::Bind { addr: addr.clone(), source })?,
    );

    info!(%addr, "Starting Reference API Buddy");

    let server_for_worker = server.clone();
    let accept_thread = std::thread::spawn(move || server_for_worker.serve_forever());

    wait_for_ctrl_c();
    info!("Shutting down...");
    server.stop();
    let _ = accept_thread.join();
    Ok(())
}

fn security_key_hint(_security: &SecurityGate) -> &'static str {
    "see configured secure_key; none was issued because one was supplied"
}

fn wait_for_ctrl_c() {
    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("failed to install Ctrl-C handler");
    let _ = rx.recv();
}
