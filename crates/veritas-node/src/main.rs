//! # Veritas Node
//!
//! Fulfillment worker: watches the ledger for inference requests, runs them
//! through the provider, publishes the audit package and submits the result.
//! Also serves the prompt registry bridge over HTTP.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use veritas_state::{InMemoryStateStore, ProcessingGuard, PromptRegistry, SledStateStore, StateStore};

mod api;
mod config;
mod ingest;
mod ledger;
mod pipeline;
mod provider;
mod state;
mod storage;
mod worker;

#[cfg(test)]
mod testing;

use config::NodeConfig;
use ingest::{LiveWatcher, Reconciler};
use ledger::{JsonRpcLedger, Ledger, RpcClient, TxSigner};
use pipeline::{Pipeline, PipelineSettings};
use provider::GroqProvider;
use state::AppState;
use storage::{ContentStore, IndexerStore};
use worker::WorkerPool;

/// Start every component and serve the bridge until the process exits.
pub async fn run_node(config: NodeConfig) -> anyhow::Result<()> {
    info!("🚀 Veritas Node starting...");
    info!("🔑 Node address: {}", config.node_key.address());

    let store: Arc<dyn StateStore> = match &config.state_dir {
        Some(dir) => {
            let path = dir.join("veritas-state");
            let store = SledStateStore::open(&path)
                .with_context(|| format!("opening state store {}", path.display()))?;
            info!("💽 Durable state at {}", path.display());
            Arc::new(store)
        }
        None => {
            warn!("State is in memory only; guard and registry are lost on restart");
            Arc::new(InMemoryStateStore::new())
        }
    };

    let guard = Arc::new(ProcessingGuard::new(store.clone(), config.retry_policy()));
    let registry = Arc::new(PromptRegistry::new(store));

    let report = guard.recover().await.context("recovering guard state")?;
    let restored = registry.recover().await.context("recovering prompt registry")?;
    info!(
        "♻️  Recovered {} fulfilled, {} pending, {} parked, {} released in-flight request(s); {} registered prompt(s)",
        report.fulfilled, report.pending, report.parked, report.released, restored
    );

    let rpc = Arc::new(RpcClient::new(config.rpc_url.clone(), config.ledger_timeout)?);
    let signer = Arc::new(
        TxSigner::connect(rpc, config.node_key.clone(), config.ledger_timeout)
            .await
            .context("connecting to ledger RPC")?,
    );
    let ledger: Arc<dyn Ledger> = Arc::new(JsonRpcLedger::new(config.contract_address, signer.clone()));
    let storage: Arc<dyn ContentStore> = Arc::new(IndexerStore::new(
        config.indexer_url.clone(),
        config.flow_contract_address,
        signer,
        config.storage_timeout,
    )?);
    let provider = Arc::new(GroqProvider::new(
        config.provider_base_url.clone(),
        config.provider_api_key.clone(),
        config.provider_timeout,
    )?);
    info!("📡 Contract {} via {}", config.contract_address, config.rpc_url);
    info!("🧠 Default model {}", config.default_model);

    let pipeline = Arc::new(Pipeline::new(
        guard.clone(),
        registry.clone(),
        ledger.clone(),
        provider,
        storage.clone(),
        config.node_key.clone(),
        PipelineSettings {
            default_model: config.default_model.clone(),
            registry_wait: config.registry_wait,
            registry_wait_attempts: config.registry_wait_attempts,
            provider_timeout: config.provider_timeout,
            storage_timeout: config.storage_timeout,
            verify_prompt_hash: config.verify_prompt_hash,
        },
    ));

    let (triggers, receiver) = mpsc::channel(config.queue_capacity);
    let _pool = WorkerPool::spawn(pipeline, receiver, config.worker_concurrency);

    let watcher = LiveWatcher::new(
        ledger.clone(),
        guard.clone(),
        triggers.clone(),
        config.event_poll_interval,
        config.event_lookback_blocks,
        config.max_log_range,
    );
    tokio::spawn(watcher.run());

    let reconciler = Reconciler::new(
        ledger.clone(),
        guard.clone(),
        triggers.clone(),
        config.reconcile_interval,
    );
    tokio::spawn(reconciler.run());

    let public_key = config.encryption_enabled.then(|| config.node_key.public_key_hex());
    if public_key.is_some() {
        info!("🔐 Prompt encryption enabled");
    }

    let state = AppState {
        registry,
        guard,
        ledger,
        storage,
        triggers,
        node: config.node_key.address(),
        public_key,
    };
    let app = create_router(state);

    let addr = config.listen_addr();
    info!("🌐 Prompt registry listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router.
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(api::health::health_check))
        .route("/register-prompt", post(api::registry::register_prompt))
        .route("/requests/:id", get(api::requests::get_request_status))
        .route("/requests/:id/retry", post(api::requests::retry_request))
        .route("/requests/:id/verify", get(api::requests::verify_request))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("veritas_node=info,tower_http=info")),
        )
        .init();

    let config = NodeConfig::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    run_node(config).await
}
