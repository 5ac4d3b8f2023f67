//! # Meridian Job Server
//!
//! Main entry point: loads configuration, starts the worker pools, the
//! lease reaper and the recurring scheduler over an in-memory job store,
//! seeds the selected demo and drains on Ctrl+C / SIGTERM.

use anyhow::Context;
use meridian_config::{AppConfig, ConfigLoader, LoggingConfig};
use meridian_jobs::{register_metrics, JobServer};
use meridian_server::demo::{self, DemoMode, DEMO_VAR};
use meridian_server::startup::{print_banner, print_startup_info};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::from_default_location() {
        Ok(loader) => loader.get().await,
        Err(e) => {
            init_logging(&LoggingConfig::default());
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.logging);
    print_banner();

    info!("Starting Meridian job server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    if let Err(e) = run(config).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    register_metrics();

    let server = JobServer::builder(config.jobs)
        .build()
        .context("invalid job configuration")?;
    demo::register(server.handlers());

    server.start().context("failed to start job server")?;
    print_startup_info(&server);

    let mode = match std::env::var(DEMO_VAR) {
        Ok(value) => value.parse::<DemoMode>().map_err(anyhow::Error::msg)?,
        Err(_) => DemoMode::default(),
    };
    if let Err(e) = demo::seed(server.dispatcher(), mode, demo::sleep_ms_from_env()).await {
        error!("Failed to seed demo jobs: {}", e);
    }

    shutdown_signal().await;
    server.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info,meridian=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
