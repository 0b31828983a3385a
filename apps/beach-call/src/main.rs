mod cli;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beach_call::{build_router, config::Config, state::AppState, telemetry};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(Config::from_env()).await,
        Commands::Watch { url, seconds } => cli::run_watch(url, seconds).await,
        Commands::Offer {
            url,
            call_id,
            offer,
            wait,
        } => cli::run_offer(url, call_id, offer, wait).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Beach Call signaling server on {}", config.bind_addr());
    info!(
        "Call TTL: {}s push, {}s poll",
        config.call_ttl_seconds, config.poll_call_ttl_seconds
    );

    let metrics = if config.metrics_enabled {
        match telemetry::install_recorder() {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to install metrics recorder; /metrics disabled");
                None
            }
        }
    } else {
        None
    };

    let state = AppState::new(&config, metrics);
    let background = state.spawn_background(&config);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Beach Call listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for task in background {
        task.abort();
    }
    info!("Beach Call stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
