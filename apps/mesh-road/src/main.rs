use anyhow::{Context, Result};
use clap::Parser;
use mesh_road::{
    cli::{self, Cli, Commands},
    config::{AuthMode, Config},
    telemetry::Telemetry,
    AppState,
};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Watch { url, room, token }) = cli.command {
        let _telemetry = Telemetry::init(false)?;
        return cli::run_watch(url, room, token).await;
    }

    let telemetry = Telemetry::init(true)?;
    let config = Config::try_from(cli.serve)?;
    if matches!(config.auth, AuthMode::Insecure) {
        warn!("identity tokens are NOT verified (--insecure-auth)");
    }
    info!(
        listen_addr = %config.listen_addr,
        rooms = config.rooms.len(),
        open_room_capacity = ?config.open_room_capacity,
        ping_interval_secs = config.ping_interval.as_secs(),
        liveness_timeout_secs = config.liveness_timeout.as_secs(),
        "starting mesh-road"
    );

    let state = AppState::from_config(&config, telemetry.metrics_handle());
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("mesh-road listening on {}", config.listen_addr);

    mesh_road::serve(listener, state, &config, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
