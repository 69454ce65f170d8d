//! Osprey - caching HTTP reverse proxy
//!
//! # Usage
//! ```bash
//! osprey --config osprey.toml
//! osprey --config osprey.toml --check    # Validate config only
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use osprey_config::ConfigLoader;
use osprey_core::{Backend, Counters, RoundRobinDirector, VariantCache};
use osprey_server::{ProxySessions, Supervisor};

/// Osprey - caching HTTP reverse proxy written in Rust
#[derive(Parser, Debug)]
#[command(name = "osprey")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "osprey.toml")]
    config: PathBuf,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    tracing::info!("Osprey v{}", env!("CARGO_PKG_VERSION"));

    let loader = Arc::new(
        ConfigLoader::load_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?,
    );
    let config = loader.get();

    tracing::info!(
        backends = config.backends.len(),
        pools = config.workers.pools,
        "Loaded configuration"
    );

    if args.check {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    let counters = Arc::new(Counters::new());

    let backends: Vec<Arc<Backend>> = config
        .backends
        .iter()
        .filter_map(|b| match b.addr.parse() {
            Ok(addr) => Some(Backend::new(b.name.clone(), addr, Arc::clone(&counters))),
            Err(e) => {
                tracing::warn!(backend = %b.name, error = %e, "skipping backend");
                None
            }
        })
        .collect();
    if backends.is_empty() {
        anyhow::bail!("no usable backends configured");
    }

    let director = Arc::new(RoundRobinDirector::new("default", backends));
    let cache = Arc::new(VariantCache::new());
    let sessions = ProxySessions::new(
        director,
        cache,
        Arc::clone(&loader),
        Arc::clone(&counters),
    );

    let listener = TcpListener::bind(config.server.listen)
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    tracing::info!("Osprey listening on {}", config.server.listen);

    let _supervisor = Supervisor::start(loader, Arc::clone(&counters), sessions, listener)?;

    // The pools run forever; the main thread turns into the stats reporter
    let mut prev_conn = 0u64;
    loop {
        std::thread::sleep(Duration::from_secs(10));
        let conn = Counters::read(&counters.sess_conn);
        tracing::debug!(
            threads = Counters::read(&counters.threads),
            queued = Counters::read(&counters.thread_queue_len),
            dropped = Counters::read(&counters.sess_dropped),
            sessions = conn - prev_conn,
            recycled = Counters::read(&counters.backend_recycle),
            "stats"
        );
        prev_conn = conn;
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
