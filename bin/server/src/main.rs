use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_core::{
    agent::{EchoAgent, ProcessAgent, StaticAgentProvider},
    dispatcher::{DEFAULT_AGENT_ACQUIRE_TIMEOUT_MS, DEFAULT_SESSION_TIMEOUT_MS},
    registry::DEFAULT_SWEEP_INTERVAL,
    Dispatcher, SessionRegistry, Store, SyncHub,
};

mod endpoint;
mod error;
mod state;

use state::AppState;

static PORT: std::sync::LazyLock<String> =
    std::sync::LazyLock::new(|| std::env::var("PORT").unwrap_or_else(|_| "3000".to_string()));
static BASE_URL: std::sync::LazyLock<String> =
    std::sync::LazyLock::new(|| std::env::var("BASE_URL").unwrap_or_else(|_| "/gm".to_string()));
static DATABASE_URL: std::sync::LazyLock<String> = std::sync::LazyLock::new(|| {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://session-core.db".to_string())
});
static SESSION_TIMEOUT_MS: std::sync::LazyLock<u64> = std::sync::LazyLock::new(|| {
    std::env::var("SESSION_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SESSION_TIMEOUT_MS)
});
static AGENT_ACQUIRE_TIMEOUT_MS: std::sync::LazyLock<u64> = std::sync::LazyLock::new(|| {
    std::env::var("AGENT_ACQUIRE_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_AGENT_ACQUIRE_TIMEOUT_MS)
});
static REGISTRY_RETENTION_MS: std::sync::LazyLock<i64> = std::sync::LazyLock::new(|| {
    std::env::var("REGISTRY_RETENTION_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(session_core::registry::DEFAULT_RETENTION_MS)
});

#[derive(Parser)]
#[command(name = "session-server")]
#[command(about = "HTTP surface for the session lifecycle and durable-message core")]
struct Cli {
    /// CLI agent binary to shell out to for every dispatched session, e.g.
    /// `claude` or `gemini`. When unset, every agentId routes to a
    /// deterministic echo agent (useful for local development and tests).
    #[arg(long)]
    agent_command: Option<String>,

    /// Extra arguments passed to `--agent-command` on every invocation.
    #[arg(long)]
    agent_arg: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let store = Arc::new(Store::connect(&DATABASE_URL).await?);
    tracing::info!(database_url = %&*DATABASE_URL, "store connected and migrated");

    let registry = SessionRegistry::new(*REGISTRY_RETENTION_MS);
    registry.spawn_sweeper(DEFAULT_SWEEP_INTERVAL);

    let sync_hub = Arc::new(SyncHub::new());

    let agents: Arc<dyn session_core::AgentProvider> = match cli.agent_command {
        Some(binary) => Arc::new(StaticAgentProvider::new(Arc::new(ProcessAgent::new(
            binary,
            cli.agent_arg,
        )))),
        None => Arc::new(StaticAgentProvider::new(Arc::new(EchoAgent))),
    };

    let dispatcher = Dispatcher::new(
        store.clone(),
        registry.clone(),
        sync_hub.clone(),
        agents,
        *SESSION_TIMEOUT_MS,
        *AGENT_ACQUIRE_TIMEOUT_MS,
    );

    let state = AppState {
        store,
        registry,
        sync_hub,
        dispatcher,
    };

    let app = Router::new()
        .nest(&BASE_URL, endpoint::create_router(state))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let bind_addr = format!("0.0.0.0:{}", &*PORT);
    tracing::info!(bind_addr = %bind_addr, base_url = %&*BASE_URL, "session-server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
