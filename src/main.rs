//! Tus Uploadr - resumable upload server for the tus.io protocol

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tus_uploadr::authz::{AllowAllAuthorizer, Authorizer, JwtAuthorizer};
use tus_uploadr::config::{Config, LogFormat};
use tus_uploadr::reaper::ExpiryReaper;
use tus_uploadr::{notify, TusServer, UploadService};

/// Tus Uploadr - resumable upload server
#[derive(Parser, Debug)]
#[command(name = "tus-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level, overrides logging.level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the tus endpoint (default)
    Serve,
    /// Run one expiry sweep and exit
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    init_logging(&config, args.log_level.as_deref())?;

    info!("Starting Tus Uploadr v{}", tus_uploadr::VERSION);
    info!("Loaded configuration from {:?}", args.config);

    if config.storage.backend == tus_uploadr::config::StorageBackend::Filesystem {
        tokio::fs::create_dir_all(&config.storage.files_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", config.storage.files_dir))?;
    }

    let notifier = notify::from_config(&config.hooks)?;
    let service = Arc::new(UploadService::from_config(&config, notifier)?);

    match args.command.unwrap_or(Command::Serve) {
        Command::Sweep => {
            let report = ExpiryReaper::new(service).sweep(chrono::Utc::now()).await;
            info!(
                scanned = report.scanned,
                expired = report.expired,
                busy = report.busy,
                "Sweep complete"
            );
            Ok(())
        }
        Command::Serve => serve(config, service).await,
    }
}

async fn serve(config: Config, service: Arc<UploadService>) -> anyhow::Result<()> {
    let authorizer: Arc<dyn Authorizer> = match (&config.auth.jwt, config.auth.enabled) {
        (Some(jwt), true) => Arc::new(JwtAuthorizer::from_config(jwt)?),
        _ => Arc::new(AllowAllAuthorizer),
    };

    #[cfg(feature = "metrics")]
    let mut metrics_server = if config.metrics.enabled {
        let mut server = tus_uploadr::metrics::server::MetricsServer::builder()
            .port(config.metrics.port)
            .build()?;
        let addr = server.start().await?;
        info!("Metrics server listening on {}", addr);
        Some(server)
    } else {
        None
    };

    let mut reaper = ExpiryReaper::new(Arc::clone(&service));
    if config.expiration.sweep_interval_secs > 0 {
        reaper.start(Duration::from_secs(config.expiration.sweep_interval_secs));
    }

    let server = TusServer::bind(&config.server.address, service, authorizer).await?;
    server.run().await?;

    reaper.shutdown().await;
    #[cfg(feature = "metrics")]
    if let Some(server) = metrics_server.as_mut() {
        server.shutdown().await;
    }
    Ok(())
}

fn init_logging(config: &Config, level_override: Option<&str>) -> anyhow::Result<()> {
    let level = level_override.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
