//! WanderLink trip coordinator, entry point.
//!
//! Serves the participant pool, trip sessions, location checks and the
//! `AgentStaking` workflow over a small Axum REST API.  Chain actions are
//! logged to SQLite as receipts.

mod api;
mod config;
mod db;
mod errors;
mod evm;
mod location;
mod negotiation;
mod pool;
mod receipts;
mod sessions;
mod staking;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use evm::EvmClient;
use location::LocationService;
use negotiation::{HttpAgentClient, NegotiationAgent, Negotiator};
use pool::ParticipantPoolStore;
use sessions::TripSessionStore;
use staking::StakingWorkflow;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let db = db::init_pool(&config.database_url).await?;

    // Shared by the chain client and the agent client.
    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;

    let staking = match EvmClient::from_config(client.clone(), &config)? {
        Some(evm) => Some(StakingWorkflow::new(Arc::new(evm))),
        None => {
            warn!("CONTRACT_ADDRESS or OPERATOR_PRIVATE_KEY not set; chain routes are disabled");
            None
        }
    };

    let agent: Option<Arc<dyn NegotiationAgent>> = match &config.agent_service_url {
        Some(url) => Some(Arc::new(HttpAgentClient::new(client, url))),
        None => {
            warn!("AGENT_SERVICE_URL not set; negotiation uses median budget fallback");
            None
        }
    };

    let state = Arc::new(api::AppState {
        negotiator: Negotiator::new(agent, config.max_stake_percent, config.usd_per_hbar),
        pool_store: ParticipantPoolStore::new(),
        sessions: TripSessionStore::new(),
        location: LocationService,
        staking,
        db,
        config: config.clone(),
    });

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
        }
    });

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Coordinator stopped");
    Ok(())
}
