//! Shared fixtures: a scripted upstream and a fully wired test app over
//! the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

use tokenflow::cache::KvCache;
use tokenflow::config::Config;
use tokenflow::entities::EntityRegistry;
use tokenflow::error::UpstreamError;
use tokenflow::graph::FlowGraphEngine;
use tokenflow::http::{router, AppState};
use tokenflow::intent::IntentClient;
use tokenflow::risk::RiskEngine;
use tokenflow::storage::{MemoryStore, Store};
use tokenflow::tenant::rate_limit::KeyRateLimiter;
use tokenflow::tenant::webhook::WebhookProcessor;
use tokenflow::tenant::TenantGate;
use tokenflow::upstream::types::TxType;
use tokenflow::upstream::{Transfer, TransferSource, UpstreamClient};

pub const TEST_SALT: &str = "integration-test-salt-0123456789abcdef";
pub const TEST_WEBHOOK_SECRET: &str = "integration-webhook-secret-0123456789";

/// Upstream fake returning pre-seeded transfers, indexed by participant.
#[derive(Default)]
pub struct ScriptedUpstream {
    by_address: HashMap<String, Vec<Transfer>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transfer: Transfer) {
        self.by_address
            .entry(transfer.from_address.clone())
            .or_default()
            .push(transfer.clone());
        if transfer.to_address != transfer.from_address {
            self.by_address
                .entry(transfer.to_address.clone())
                .or_default()
                .push(transfer);
        }
    }

    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.push(transfer);
        self
    }
}

#[async_trait]
impl TransferSource for ScriptedUpstream {
    async fn token_transfers(
        &self,
        address: &str,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError> {
        Ok(self
            .by_address
            .get(address)
            .map(|transfers| {
                transfers
                    .iter()
                    .filter(|t| t.token_mint == token_mint)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// A plain transfer for seeding scenarios.
pub fn transfer(
    signature: &str,
    from: &str,
    to: &str,
    mint: &str,
    amount: u128,
    block_time: i64,
) -> Transfer {
    Transfer {
        signature: signature.to_string(),
        from_address: from.to_string(),
        to_address: to.to_string(),
        token_mint: mint.to_string(),
        amount,
        decimals: 6,
        instruction_index: 0,
        block_time,
        tx_type: TxType::Transfer,
        swap_direction: None,
        swap_info: None,
    }
}

pub fn test_config() -> Config {
    Config {
        upstream_api_key: "test-upstream-key".into(),
        // Unroutable: anything that really dials out fails fast.
        upstream_rpc_url: "http://127.0.0.1:1".into(),
        upstream_api_url: "http://127.0.0.1:1".into(),
        database_url: "postgres://unused".into(),
        redis_url: None,
        api_key_salt: TEST_SALT.into(),
        admin_api_key: "admin-key-0123456789abcdef0123456789".into(),
        webhook_secret: TEST_WEBHOOK_SECRET.into(),
        intent_service_url: "http://127.0.0.1:1".into(),
        allowed_origins: vec![],
        production: false,
        port: 0,
    }
}

/// Wire the full service over the given store and transfer source.
pub fn test_app(store: Arc<MemoryStore>, source: Arc<dyn TransferSource>) -> (Router, AppState) {
    let config = Arc::new(test_config());
    let store_dyn: Arc<dyn Store> = store;

    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_rpc_url.clone(),
        config.upstream_api_url.clone(),
        config.upstream_api_key.clone(),
        KvCache::disabled(),
    ));
    let registry = Arc::new(EntityRegistry::new(Arc::clone(&store_dyn)));
    let graph = Arc::new(FlowGraphEngine::new(
        Arc::clone(&source),
        Arc::clone(&registry),
        Arc::clone(&store_dyn),
    ));
    let risk = Arc::new(RiskEngine::new(
        source,
        Arc::clone(&registry),
        Arc::clone(&graph),
        Arc::clone(&store_dyn),
    ));
    let intent = Arc::new(IntentClient::new(config.intent_service_url.clone()));
    let gate = Arc::new(TenantGate::new(
        Arc::clone(&store_dyn),
        config.api_key_salt.clone(),
        KeyRateLimiter::new(KvCache::disabled()),
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        Arc::clone(&gate),
        config.webhook_secret.clone(),
    ));

    let state = AppState::new(
        config, store_dyn, upstream, registry, graph, risk, intent, gate, webhooks,
    );
    (router(state.clone()), state)
}

/// Drive one request through the router and decode the JSON response.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("infallible");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

pub fn json_request(method: &str, uri: &str, api_key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

pub fn get_request(uri: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}
