mod auth;
mod config;
mod constants;
mod error;
mod models;
mod routes;
mod transforms;

use auth::{OAuthManager, TokenStore};
use axum::ServiceExt;
use clap::Parser;
use config::Config;
use models::ModelRegistry;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::normalize_path::NormalizePath;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub oauth: OAuthManager,
    pub models: ModelRegistry,
    pub http_client: Client,
    pub messages_url: String,
    /// Bound on getting response headers (and the full body when not streaming)
    pub request_timeout: Duration,
    /// Bound on each read of a streaming response body
    pub stream_idle_timeout: Duration,
    /// Shared key required on `/v1/*`, if configured
    pub api_key: Option<String>,
}

#[derive(Parser)]
#[command(name = "anthropic-max-proxy")]
#[command(about = "OpenAI-compatible proxy for a Claude subscription")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "ANTHROPIC_PROXY_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "ANTHROPIC_PROXY_PORT")]
    port: Option<u16>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    // Shared HTTP client with connection pooling. Per-call timeouts are
    // applied by the callers so long streams are not cut off.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .build()?;

    let oauth = OAuthManager::new(
        http_client.clone(),
        config.oauth.clone(),
        TokenStore::new(config.token_file.clone()),
        config.request_timeout,
    )
    .await?;

    let models = ModelRegistry::new(&config.model_aliases);
    info!("Serving {} model aliases", models.list().len());

    if config.api_key.is_some() {
        info!("API key required for /v1 routes");
    }

    let state = Arc::new(AppState {
        oauth,
        models,
        http_client,
        messages_url: config.messages_url(),
        request_timeout: config.request_timeout,
        stream_idle_timeout: config.stream_idle_timeout,
        api_key: config.api_key.clone(),
    });

    let app = NormalizePath::trim_trailing_slash(routes::build_router(state, &config.cors_mode));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(
        "Starting anthropic-max-proxy v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);
    info!("OAuth status: http://{}/auth/status", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
