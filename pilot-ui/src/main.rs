//! Pilot chat server: runs conversation turns and streams their events.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use pilot::io::config::{DEFAULT_CONFIG_FILE, load_config};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::state::{AppState, HttpBackend};

#[derive(Parser)]
#[command(name = "pilot-ui")]
#[command(about = "HTTP server that runs pilot turns and streams their events")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Config file (TOML); defaults apply when it is missing
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pilot_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = load_config(&args.config)?;
    match &config.provider {
        Some(provider) => info!(model = %provider.model, url = %provider.api_url, "default provider"),
        None => warn!("no [provider] section; requests must carry their own config"),
    }

    let state = AppState::new(config, Arc::new(HttpBackend));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
