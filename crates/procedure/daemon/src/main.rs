//! Federation Manager procedure daemon
//!
//! Runs the procedure workflow engine with its timer manager:
//! - Registers the built-in and on-disk procedure definitions
//! - Delivers step timers from the durable schedule
//! - Shuts down gracefully on Ctrl+C or SIGTERM

use anyhow::Context;
use clap::Parser;
use procedure_daemon::{DaemonConfig, Runtime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Procedure daemon CLI
#[derive(Parser)]
#[command(name = "fedmgrd")]
#[command(about = "Federation Manager - procedure workflow daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FEDMGR_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, env = "FEDMGR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "FEDMGR_LOG_JSON")]
    json: bool,

    /// Directory of extra procedure definitions (JSON)
    #[arg(short, long, env = "FEDMGR_DEFINITIONS")]
    definitions: Option<std::path::PathBuf>,

    /// Load configuration and definitions, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading configuration {:?}", cli.config))?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if let Some(dir) = cli.definitions {
        config.procedures.definition_dir = Some(dir);
    }

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let runtime = Runtime::build(&config)
        .await
        .context("starting the procedure engine")?;

    let definitions = runtime.engine().list_definitions()?;
    for definition in &definitions {
        tracing::info!(
            procedure = %definition.name,
            version = definition.version,
            steps = definition.step_count(),
            transitions = definition.transition_count(),
            "Procedure available"
        );
    }

    if cli.check {
        println!("configuration OK, {} procedure(s) registered", definitions.len());
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        poll_interval_secs = config.timers.poll_interval_secs,
        "Procedure daemon started"
    );

    runtime.run(shutdown_signal()).await?;
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
