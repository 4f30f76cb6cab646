//! Service entry point: environment contract, service wiring, serve.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tokenflow::cache::KvCache;
use tokenflow::config::Config;
use tokenflow::entities::EntityRegistry;
use tokenflow::graph::FlowGraphEngine;
use tokenflow::http::{router, AppState};
use tokenflow::intent::IntentClient;
use tokenflow::risk::RiskEngine;
use tokenflow::storage::{PgStore, Store};
use tokenflow::tenant::rate_limit::KeyRateLimiter;
use tokenflow::tenant::webhook::WebhookProcessor;
use tokenflow::tenant::TenantGate;
use tokenflow::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // A broken environment contract refuses to start the process.
    let config = Arc::new(Config::from_env().context("environment contract violated")?);
    info!(
        production = config.production,
        port = config.port,
        cache = config.redis_url.is_some(),
        "starting tokenflow-api"
    );

    let store: Arc<dyn Store> = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("database unavailable")?,
    );

    let cache = KvCache::connect(config.redis_url.as_deref()).await;
    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_rpc_url.clone(),
        config.upstream_api_url.clone(),
        config.upstream_api_key.clone(),
        cache.clone(),
    ));

    let registry = Arc::new(EntityRegistry::new(Arc::clone(&store)));
    registry.seed().await.context("entity seeding failed")?;

    let graph = Arc::new(FlowGraphEngine::new(
        upstream.clone(),
        Arc::clone(&registry),
        Arc::clone(&store),
    ));
    let risk = Arc::new(RiskEngine::new(
        upstream.clone(),
        Arc::clone(&registry),
        Arc::clone(&graph),
        Arc::clone(&store),
    ));
    let intent = Arc::new(IntentClient::new(config.intent_service_url.clone()));

    let gate = Arc::new(TenantGate::new(
        Arc::clone(&store),
        config.api_key_salt.clone(),
        KeyRateLimiter::new(cache),
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        Arc::clone(&gate),
        config.webhook_secret.clone(),
    ));

    let state = AppState::new(
        Arc::clone(&config),
        store,
        upstream,
        registry,
        graph,
        risk,
        intent,
        gate,
        webhooks,
    );

    let app = router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received, draining connections");
}
