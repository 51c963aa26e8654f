use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ssh_honeypot::config::Config;
use ssh_honeypot::db::{self, SqliteStore};
use ssh_honeypot::geoip::GeoIp;
use ssh_honeypot::handlers;
use ssh_honeypot::metrics::MetricsAggregator;
use ssh_honeypot::web;

#[derive(Parser, Debug)]
#[command(name = "ssh-honeypot", about = "SSH credential-capture honeypot")]
struct Cli {
    /// Configuration file (TOML); missing files fall back to defaults
    #[arg(short, long, global = true, env = "HONEYPOT_CONFIG", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the honeypot (default)
    Serve,
    /// Import a JSON-lines connection log into the SQLite database
    Migrate {
        /// Log to import; defaults to storage.log_path
        #[arg(short, long)]
        source: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(&config.logging.level);
    info!("Configuration loaded from {}", cli.config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate { source } => {
            let source = source.unwrap_or_else(|| config.storage.log_path.clone());
            run_migration(&config, &source).await
        }
    }
}

/// Use LOG_FORMAT=gcp for structured GCP Cloud Logging
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting SSH honeypot...");

    let store = db::open(&config.storage).await?;

    let geoip = Arc::new(GeoIp::from_config(&config.geoip).context("failed to build GeoIP client")?);
    if !geoip.is_available() {
        info!("Events will not be geolocated");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut background = Vec::new();
    if config.metrics.enabled {
        let metrics = Arc::new(MetricsAggregator::new()?);

        let aggregator = metrics.clone();
        let aggregator_store = store.clone();
        let interval = std::time::Duration::from_secs(config.metrics.refresh_interval_secs);
        let token = shutdown.clone();
        background.push(tokio::spawn(async move {
            aggregator.run(aggregator_store.as_ref(), interval, token).await;
            Ok::<_, anyhow::Error>(())
        }));

        let addr = config.metrics_addr();
        let token = shutdown.clone();
        background.push(tokio::spawn(async move {
            web::start_server(&addr, metrics, token).await
        }));
    } else {
        info!("Metrics disabled");
    }

    let result = handlers::start(&config, geoip, store, shutdown.clone()).await;
    // Make sure the background tasks stop even if the listener failed
    shutdown.cancel();

    for task in background {
        match task.await {
            Ok(Err(e)) => error!("Background task failed: {:#}", e),
            Err(e) => error!("Background task panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }

    result?;
    info!("SSH honeypot stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    token.cancel();
}

async fn run_migration(config: &Config, source: &std::path::Path) -> Result<()> {
    info!(
        "Migrating {} into {}",
        source.display(),
        config.storage.database_path.display()
    );

    let store = SqliteStore::connect(&config.storage.database_path).await?;

    let report = db::migrate(source, &store)
        .await
        .with_context(|| format!("migration from {} failed", source.display()))?;

    info!(
        "Migration finished: {} migrated, {} skipped, {} failed",
        report.migrated, report.skipped, report.failed
    );
    Ok(())
}
