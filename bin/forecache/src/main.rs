//! Forecache daemon
//!
//! Polls forecast model status documents, downloads new output into the
//! local cache and keeps it within its retention horizons.

mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use forecache_engine::{Engine, Mode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "forecache")]
#[command(about = "Forecast data ingestion and cache daemon")]
#[command(version)]
struct Args {
    /// Engine configuration file (TOML or JSON)
    #[arg(short, long, env = "FORECACHE_CONFIG", default_value = "config/forecache.toml")]
    config: PathBuf,

    /// Model definitions file (JSON or TOML)
    #[arg(short, long, env = "FORECACHE_MODELS", default_value = "config/models.json")]
    models: PathBuf,

    /// Cache directory (overrides config)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Index database file (overrides config)
    #[arg(long)]
    index_path: Option<PathBuf>,

    /// Write empty placeholder files instead of downloading
    #[arg(long)]
    simulate: bool,

    /// Check every enabled model once right after start
    #[arg(long)]
    immediate: bool,

    /// Skip re-indexing the cache directory at start
    #[arg(long)]
    no_rebuild: bool,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Seconds between stats log lines (0 disables)
    #[arg(long, default_value = "30")]
    stats_interval: u64,
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

fn log_stats(engine: &Engine) {
    let stats = engine.stats();
    let queues = engine.queue_info();
    info!(
        "Stats: checked={} downloaded={} skipped={} deleted={} errors={} | download queue waiting={} running={} | cleanup queue waiting={} running={}",
        stats.files_checked,
        stats.files_downloaded,
        stats.files_skipped,
        stats.files_deleted,
        stats.total_errors(),
        queues.download.waiting,
        queues.download.running,
        queues.cleanup.waiting,
        queues.cleanup.running
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration (CLI takes precedence)
    let mut config = settings::load_engine_config(&args.config)?;
    if let Some(dir) = args.cache_dir.clone() {
        config.storage.cache_dir = dir;
    }
    if let Some(path) = args.index_path.clone() {
        config.index.path = path;
    }
    if args.no_rebuild {
        config.index.rebuild_on_start = false;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.logging.json |= args.log_json;

    // Initialize logging
    init_logging(&config.logging.level, config.logging.json);

    info!("Starting forecache v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());
    info!("Models file: {}", args.models.display());
    info!("Cache directory: {}", config.storage.cache_dir.display());

    let registry = settings::load_models(&args.models)?;
    for model in registry.iter() {
        info!(
            "Model {} ({}): enabled={} retention={:?}h",
            model.key, model.name, model.enabled, model.retention_hours
        );
    }

    let mode = if args.simulate {
        info!("Simulated mode: downloads write empty placeholder files");
        Mode::Simulated
    } else {
        Mode::Live
    };

    let engine = Engine::open(config, registry, mode).context("Failed to open engine")?;
    engine.start().await.context("Failed to start engine")?;

    if args.immediate {
        info!("Running immediate check for all enabled models");
        let keys: Vec<String> = engine.registry().enabled().map(|m| m.key.clone()).collect();
        for key in keys {
            if let Err(e) = engine.check_now(&key).await {
                error!("Immediate check for {} failed: {}", key, e);
            }
        }
    }

    let stats_every = (args.stats_interval > 0).then(|| Duration::from_secs(args.stats_interval));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    match stats_every {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = &mut shutdown => break,
                    _ = ticker.tick() => log_stats(&engine),
                }
            }
        }
        None => shutdown.await,
    }

    info!("Shutdown signal received, stopping");
    engine.stop().await;
    log_stats(&engine);
    info!("Forecache stopped");
    Ok(())
}
