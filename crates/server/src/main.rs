//! Clogs server - log and metrics ingestion with per-container health state
//!
//! Agents push heartbeats, metric batches and log batches over HTTP; the
//! server keeps bounded history and a health verdict for every container.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clogs_lib::{health::components, now_millis, ClogsCore, LivenessMarker};
use clogs_server::{api, config::ServerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "clogs-server", version, about = "Clogs ingestion and health server")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "CLOGS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default)
    Serve,
    /// Exit 0 if the liveness marker was touched within the progress window
    SelfCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.config).await,
        Command::SelfCheck => self_check(cli.config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Server failed");
            ExitCode::FAILURE
        }
    }
}

fn self_check(config_path: Option<PathBuf>) -> Result<ExitCode> {
    let config = ServerConfig::load(config_path.as_deref())?;
    let alive = LivenessMarker::check(
        &config.liveness_marker_path,
        now_millis(),
        config.progress_window(),
    );

    if alive {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(path = %config.liveness_marker_path.display(), "Liveness marker is stale or missing");
        Ok(ExitCode::FAILURE)
    }
}

async fn serve(config_path: Option<PathBuf>) -> Result<ExitCode> {
    info!("Starting clogs-server");

    let config = ServerConfig::load(config_path.as_deref())?;
    let settings = config
        .core_settings()
        .context("Invalid configuration")?;
    info!(
        rules = settings.rules.thresholds.len(),
        log_patterns = settings.rules.log_patterns.len(),
        sweep_interval_ms = settings.effective_sweep_interval().as_millis() as u64,
        "Server configured"
    );

    let core = Arc::new(ClogsCore::new(settings));
    core.register_components().await;

    let marker = LivenessMarker::new(&config.liveness_marker_path);
    marker.init(now_millis()).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweep_handle = tokio::spawn(core.sweeper().with_marker(marker).run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.listen_port))?;

    core.logger.log_startup(SERVER_VERSION, config.listen_port);
    core.health.set_ready(true).await;

    let state = Arc::new(api::AppState::new(Arc::clone(&core), config.progress_window()));
    let served = api::serve(listener, state, shutdown_signal()).await;

    core.logger.log_shutdown("signal received");
    core.health.set_ready(false).await;
    core.health
        .set_unhealthy(components::INGEST, "draining")
        .await;

    if !core.pipeline.shutdown(config.shutdown_grace()).await {
        warn!(
            grace_secs = config.shutdown_grace_secs,
            "Intake queues did not drain before the grace period ended"
        );
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = sweep_handle.await {
        warn!(error = %e, "Sweep task ended abnormally");
    }

    served?;
    info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
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
}
