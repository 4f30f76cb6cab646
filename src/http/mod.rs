//! HTTP surface: shared state, router and response plumbing.

pub mod analysis;
pub mod middleware;
pub mod params;
pub mod users;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::entities::EntityRegistry;
use crate::error::ApiError;
use crate::graph::FlowGraphEngine;
use crate::intent::IntentClient;
use crate::risk::RiskEngine;
use crate::storage::models::AuthContext;
use crate::storage::Store;
use crate::tenant::webhook::WebhookProcessor;
use crate::tenant::{GateHeaders, TenantGate};
use crate::upstream::UpstreamClient;
use middleware::IpRateLimiter;

/// Maximum request body size (100 kB).
const MAX_BODY_BYTES: usize = 100 * 1024;
/// Overall per-request deadline. Detached background writes outlive it.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
/// Requests per minute per IP on the unauthenticated endpoints.
const PUBLIC_RATE_PER_MINUTE: u32 = 10;

/// Process-wide services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub upstream: Arc<UpstreamClient>,
    pub registry: Arc<EntityRegistry>,
    pub graph: Arc<FlowGraphEngine>,
    pub risk: Arc<RiskEngine>,
    pub intent: Arc<IntentClient>,
    pub gate: Arc<TenantGate>,
    pub webhooks: Arc<WebhookProcessor>,
    pub ip_limiter: Arc<IpRateLimiter>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        upstream: Arc<UpstreamClient>,
        registry: Arc<EntityRegistry>,
        graph: Arc<FlowGraphEngine>,
        risk: Arc<RiskEngine>,
        intent: Arc<IntentClient>,
        gate: Arc<TenantGate>,
        webhooks: Arc<WebhookProcessor>,
    ) -> Self {
        Self {
            config,
            store,
            upstream,
            registry,
            graph,
            risk,
            intent,
            gate,
            webhooks,
            ip_limiter: Arc::new(IpRateLimiter::new(PUBLIC_RATE_PER_MINUTE)),
        }
    }

    /// Authenticate, then enforce subscription/quota/rate. Analytics
    /// endpoints route through this; account endpoints authenticate only.
    pub async fn authorize_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<(AuthContext, GateHeaders), ApiError> {
        let ctx = self.authenticate_request(headers).await?;
        let gate_headers = self.gate.authorize(&ctx).await?;
        Ok((ctx, gate_headers))
    }

    pub async fn authenticate_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<AuthContext, ApiError> {
        let raw_key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthenticated("missing x-api-key header".into()))?;
        self.gate.authenticate(raw_key).await
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(analysis::health))
        .route(
            "/api/v1/analyze/path",
            post(analysis::analyze_path).get(analysis::analyze_path),
        )
        .route("/api/v1/risk/{address}", get(analysis::risk_assessment))
        .route("/api/v1/intent/{signature}", get(analysis::intent_inference))
        .route("/api/v1/trace", post(analysis::trace))
        .route(
            "/api/v1/analyze/token",
            post(analysis::analyze_token).get(analysis::analyze_token),
        )
        .route("/api/v1/users/register", post(users::register))
        .route("/api/v1/users/me", get(users::me))
        .route("/api/v1/users/usage", get(users::usage))
        .route("/api/v1/users/keys", get(users::list_keys).post(users::create_key))
        .route("/api/v1/users/keys/{key_id}", axum::routing::delete(users::revoke_key))
        .route("/api/v1/users/plan", post(users::change_plan))
        .route("/api/v1/users/cancel", post(users::cancel))
        .route("/webhooks/apix", post(webhooks::apix))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_context,
        ))
        .layer(TimeoutLayer::new(REQUEST_DEADLINE))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Render a JSON body with the rate/quota headers attached.
pub(crate) fn json_response(
    status: StatusCode,
    body: Value,
    gate_headers: Option<&GateHeaders>,
) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Some(gh) = gate_headers {
        gh.apply(response.headers_mut());
    }
    response
}
