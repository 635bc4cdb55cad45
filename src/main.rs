use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use jobs::System;
use router::{AppState, create_router};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "cadenza")]
#[command(about = "Cadenza - cascade deletion and data integrity engine")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<CadenzaCommands>,
}

#[derive(Subcommand)]
enum CadenzaCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for CadenzaCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    let CadenzaCommands::Common(command) = cli.command.unwrap_or_default();
    if utils::handle_common_command(&command, &config)? {
        return Ok(());
    }

    config.validate().context("Invalid configuration")?;
    tracing::info!(dsn = %config.database.dsn, "Opening document store");

    let store = common::store::open(&config.database.dsn)
        .await
        .context("Failed to open document store")?;
    let system = System::start(&config, store)
        .await
        .context("Failed to start cascade system")?;

    let addr = config.http.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {addr}"))?;
    let app = create_router(AppState::new(system.handle(), config.clone()));

    tracing::info!("Cadenza API listening on {addr}");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!("Shutdown signal handler failed: {e}");
            }
        })
        .await;

    tracing::info!("HTTP server stopped, draining job queue");
    system.shutdown(config.health.shutdown_timeout).await;

    served.context("HTTP server error")?;
    tracing::info!("Cadenza stopped");
    Ok(())
}
