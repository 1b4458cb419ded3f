//! fileshd: filesh chunk storage server
//!
//! Usage:
//!   fileshd [--config /etc/filesh/config.toml] [--listen 0.0.0.0:8080] [--memory]
//!
//! Stores opaque ciphertext chunks under `{batchId}/{chunkIndex}` in an
//! S3-compatible bucket (or in memory with `--memory`). Keys and plaintext
//! never reach the server.

mod error;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use filesh_core::config::FileshConfig;
use filesh_storage::{ObjectStore, RetryPolicy};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::metrics::ServerMetrics;
use crate::routes::{router, AppState};

#[derive(Parser, Debug)]
#[command(name = "fileshd", version, about = "filesh chunk storage server")]
struct Cli {
    /// Path to filesh.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "FILESH_CONFIG",
        default_value = "/etc/filesh/config.toml"
    )]
    config: PathBuf,

    /// Listen address (overrides server.listen)
    #[arg(long, env = "FILESH_LISTEN")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides server.log_level
    #[arg(long, env = "FILESH_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides server.log_format
    #[arg(long, env = "FILESH_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Keep chunks in process memory instead of object storage
    #[arg(long)]
    memory: bool,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(raw: &str) -> Self {
        match raw {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FileshConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.server.log_level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.server.log_format));
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        config_found = cli.config.exists(),
        memory = cli.memory,
        "fileshd starting"
    );

    let operator = if cli.memory {
        warn!("using in-memory storage: chunks are lost on exit");
        filesh_storage::memory_operator()?
    } else {
        let (access_key, secret_key) = filesh_storage::operator::credentials_from_env()?;
        filesh_storage::build_from_core_config(&config.storage, &access_key, &secret_key)?
    };

    let store = ObjectStore::new(operator, RetryPolicy::from_config(&config.storage));
    match store.check_health().await {
        Ok(()) => info!(bucket = %config.storage.bucket, "storage reachable"),
        Err(e) => warn!("storage not reachable yet: {e}"),
    }

    let state = AppState::new(store, ServerMetrics::new());
    let app = router(state, &config.server);

    let listen = cli.listen.unwrap_or(config.server.listen);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(addr = %listen, metrics = config.server.metrics, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("fileshd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("registering SIGTERM handler failed: {e}");
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
    info!("shutdown signal received, draining connections");
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
