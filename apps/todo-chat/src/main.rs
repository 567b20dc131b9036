mod cli;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use todo_chat::{build_router, AppState, ChatService, RedisStore, ServerConfig, SharedStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = telemetry::Telemetry::init()?;

    if let Some(Commands::Send {
        url,
        room,
        message,
        timeout_secs,
    }) = cli.command
    {
        return cli::run_send_client(&url, &room, &message, Duration::from_secs(timeout_secs))
            .await;
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        redis_url = %config.redis_url,
        history_window = config.chat.retention.window,
        retention_secs = config.chat.retention.horizon.num_seconds(),
        expired_entries = ?config.chat.retention.expired_entries,
        "starting todo-chat server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store = RedisStore::connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?;
    let store: SharedStore = Arc::new(store);

    let chat = ChatService::new(store.clone(), config.chat.clone());
    chat.start_sweeper();

    let state = AppState::new(store, chat.clone(), Some(metrics));
    let router = build_router(state, config.static_dir.as_deref());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("todo-chat listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; stopping background tasks"
    );
    if tokio::time::timeout(config.shutdown_grace, chat.shutdown())
        .await
        .is_err()
    {
        warn!("background tasks did not stop within the grace period");
    }
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
