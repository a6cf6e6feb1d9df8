use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use user_api::config::config;
use user_api::database::{pool, MemoryModel, ModelRef, PgModel};
use user_api::models::user;

#[derive(Parser, Debug)]
#[command(name = "user-api", version, about = "User REST API server")]
struct Args {
    /// Bind address (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Keep records in memory even when DATABASE_URL is set
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL and friends
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let args = Args::parse();

    // Initialize configuration (this loads the config singleton)
    let config = config();
    info!("Starting user API in {:?} mode", config.environment);

    let model: ModelRef = match config.database.url.as_deref() {
        Some(_) if !args.memory => {
            let pool = pool::connect(&config.database).await?;
            let model = PgModel::new(user::schema(), pool)?;
            model.sync_schema().await?;
            Arc::new(model)
        }
        _ => {
            warn!("No database configured, records are kept in memory");
            Arc::new(MemoryModel::new(user::schema()))
        }
    };

    let host = args.host.unwrap_or_else(|| config.server.host.clone());
    let port = args.port.unwrap_or(config.server.port);
    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    info!("Listening on http://{}", bind_addr);

    let app = user_api::app(model, config);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
