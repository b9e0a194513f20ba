use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kiro_gateway::auth::{CredentialPool, HttpTokenExchanger};
use kiro_gateway::client::KiroClient;
use kiro_gateway::config::{GatewayConfig, load_credentials};
use kiro_gateway::handler::{
    AppState, handle_add_token, handle_chat_completions, handle_delete_token, handle_list_tokens,
    handle_messages, require_api_key,
};
use kiro_gateway::transform::ToolSchemaCache;

#[derive(Parser)]
#[command(name = "kiro-gateway", about = "Anthropic/OpenAI gateway for the Kiro backend")]
struct Cli {
    /// Path to a TOML config file; environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address override (e.g. 0.0.0.0:8080)
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kiro_gateway=info,warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::from_env()?,
    };
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    let (credentials, auth_path) = load_credentials()?;
    if credentials.is_empty() {
        warn!("starting with an empty credential pool; add accounts via POST /api/tokens");
    }

    let exchanger = Arc::new(HttpTokenExchanger::new(
        config.upstream.social_auth_endpoint.clone(),
        config.upstream.idc_auth_endpoint.clone(),
    )?);
    let pool = CredentialPool::new(credentials, exchanger);
    pool.warm_up().await;

    let backend = Arc::new(KiroClient::new(config.upstream.backend_endpoint.clone())?);

    let listen_addr = config.server.listen_addr.clone();
    let state = Arc::new(AppState {
        pool,
        backend,
        tool_cache: ToolSchemaCache::new(),
        config,
        auth_path,
    });

    let v1 = Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let app = Router::new()
        .merge(v1)
        .route("/api/tokens", get(handle_list_tokens))
        .route("/api/tokens", post(handle_add_token))
        .route("/api/tokens/{index}", delete(handle_delete_token))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(listen = %listen_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install shutdown signal handler");
    }
    info!("shutting down");
}
