use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

mod app;
mod ws;

#[derive(Parser, Debug)]
#[command(name = "parlance", about = "Real-time conversational AI runtime")]
struct Cli {
    /// Path to parlance.toml (default: ~/.parlance/parlance.toml)
    #[arg(long)]
    config: Option<String>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlance=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = parlance_core::config::ParlanceConfig::load(cli.config.as_deref())
        .unwrap_or_else(|e| {
            warn!("config load failed ({e}), using defaults");
            parlance_core::config::ParlanceConfig::default()
        });
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

    let state = Arc::new(app::AppState::new(config.clone())?);
    let router = app::build_router(Arc::clone(&state))?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("parlance listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<app::AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining actors");
    state.dispatcher.shutdown().await;
}
