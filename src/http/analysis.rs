//! Analytics endpoints: flow paths, risk, intent, trace, token activity.

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::collections::HashSet;

use chrono::Utc;
use std::time::Instant;

use super::middleware::{client_ip, RequestId};
use super::{json_response, params, AppState};
use crate::classifier;
use crate::error::{ApiError, UpstreamError};
use crate::graph::types::Direction;
use crate::security;
use crate::storage::models::{ApiUsageLog, AuthContext, EntityKind};
use crate::tenant::GateHeaders;
use crate::upstream::types::{Transfer, TxType};

/// Downcast engine-internal failures back to the API taxonomy.
fn engine_error(err: anyhow::Error) -> ApiError {
    match err.downcast::<UpstreamError>() {
        Ok(upstream) => ApiError::Upstream(upstream),
        Err(other) => ApiError::Internal(other),
    }
}

/// Usage-log row for one authorized call, appended on a detached task.
fn usage_log(
    ctx: &AuthContext,
    headers: &HeaderMap,
    endpoint: &'static str,
    method: &'static str,
    status: StatusCode,
    started: Instant,
    request_id: &str,
) -> ApiUsageLog {
    ApiUsageLog {
        user_id: ctx.user.id,
        api_key_id: ctx.api_key.id,
        endpoint: endpoint.to_string(),
        method: method.to_string(),
        status_code: status.as_u16(),
        response_time_ms: started.elapsed().as_millis() as u64,
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ip_address: Some(client_ip(headers).to_string()),
        request_id: request_id.to_string(),
        timestamp: Utc::now(),
    }
}

/// Liveness. No auth; reports cache mode, breaker state and the outcome
/// of a short upstream probe.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let upstream_ok = state.upstream.probe_health().await;
    let breaker = state.upstream.breaker().stats().await;
    Json(json!({
        "status": "ok",
        "service": "tokenflow-api",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": if state.config.redis_url.is_some() { "redis" } else { "disabled" },
        "upstream": if upstream_ok { "ok" } else { "unreachable" },
        "upstream_breaker": breaker,
    }))
}

/// POST|GET /api/v1/analyze/path
pub async fn analyze_path(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> Response {
    let result = analyze_path_inner(&state, &headers, &query, body.as_deref(), &request_id.0).await;
    finish(result, &request_id)
}

async fn analyze_path_inner(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Option<&Value>,
    request_id: &str,
) -> Result<(StatusCode, Value, GateHeaders), ApiError> {
    let started = Instant::now();
    let (ctx, gate_headers) = state.authorize_request(headers).await?;

    let request = params::normalize(query, body);
    let token = params::require_token(&request)?;
    let address = params::require_address(&request)?;
    let direction = params::direction(&request)?;
    let max_depth = params::max_depth(&request)?;
    let window = params::time_range(&request)?;
    let include_intent = params::bool_param(&request, "includeIntent");

    let mut paths = match direction {
        Direction::Forward => state
            .graph
            .build_forward_paths(&address, &token, max_depth, window)
            .await
            .map_err(engine_error)?,
        Direction::Backward => state
            .graph
            .build_backward_paths(&address, &token, max_depth, window)
            .await
            .map_err(engine_error)?,
    };

    if include_intent && !paths.is_empty() {
        if let Some(prediction) = predict_address_intent(state, &address, &token).await {
            for path in &mut paths {
                path.intent = Some(prediction.0.clone());
                path.intent_confidence = Some(prediction.1);
            }
        }
    }

    let body = json!({
        "address": address,
        "token": token,
        "direction": direction,
        "pathCount": paths.len(),
        "paths": paths,
    });
    state.gate.record_usage(usage_log(
        &ctx,
        headers,
        "/api/v1/analyze/path",
        "POST",
        StatusCode::OK,
        started,
        request_id,
    ));
    Ok((StatusCode::OK, body, gate_headers))
}

/// Intent of the address's most recent transaction for the token, used
/// to annotate returned paths on request.
async fn predict_address_intent(
    state: &AppState,
    address: &str,
    token: &str,
) -> Option<(String, f64)> {
    let transfers = state
        .upstream
        .get_token_transfers(address, token, 1)
        .await
        .ok()?;
    let signature = &transfers.first()?.signature;
    let tx = state.upstream.get_transaction(signature).await.ok()??;
    let prediction = state.intent.predict(&tx).await;
    Some((prediction.intent.as_str().to_string(), prediction.confidence))
}

/// GET /api/v1/risk/{address}?token=MINT
pub async fn risk_assessment(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(address): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = risk_inner(&state, &headers, &address, &query, &request_id.0).await;
    finish(result, &request_id)
}

async fn risk_inner(
    state: &AppState,
    headers: &HeaderMap,
    address: &str,
    query: &HashMap<String, String>,
    request_id: &str,
) -> Result<(StatusCode, Value, GateHeaders), ApiError> {
    let started = Instant::now();
    let (ctx, gate_headers) = state.authorize_request(headers).await?;

    security::validate_address(address).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let request = params::normalize(query, None);
    let token = params::require_token(&request)?;

    let assessment = state
        .risk
        .assess(address, &token)
        .await
        .map_err(engine_error)?;

    state.gate.record_usage(usage_log(
        &ctx,
        headers,
        "/api/v1/risk/:address",
        "GET",
        StatusCode::OK,
        started,
        request_id,
    ));
    Ok((StatusCode::OK, serde_json::to_value(assessment)?, gate_headers))
}

/// GET /api/v1/intent/{signature}
pub async fn intent_inference(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(signature): Path<String>,
) -> Response {
    let result = intent_inner(&state, &headers, &signature, &request_id.0).await;
    finish(result, &request_id)
}

async fn intent_inner(
    state: &AppState,
    headers: &HeaderMap,
    signature: &str,
    request_id: &str,
) -> Result<(StatusCode, Value, GateHeaders), ApiError> {
    let started = Instant::now();
    let (ctx, gate_headers) = state.authorize_request(headers).await?;

    security::validate_signature(signature)
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let tx = state
        .upstream
        .get_transaction(signature)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown transaction: {}", signature)))?;

    let prediction = state.intent.predict(&tx).await;
    let body = json!({
        "signature": signature,
        "intent": prediction.intent,
        "confidence": prediction.confidence,
    });
    state.gate.record_usage(usage_log(
        &ctx,
        headers,
        "/api/v1/intent/:signature",
        "GET",
        StatusCode::OK,
        started,
        request_id,
    ));
    Ok((StatusCode::OK, body, gate_headers))
}

/// POST /api/v1/trace
pub async fn trace(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> Response {
    let result = trace_inner(&state, &headers, &query, body.as_deref(), &request_id.0).await;
    finish(result, &request_id)
}

async fn trace_inner(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Option<&Value>,
    request_id: &str,
) -> Result<(StatusCode, Value, GateHeaders), ApiError> {
    let started = Instant::now();
    let (ctx, gate_headers) = state.authorize_request(headers).await?;

    let request = params::normalize(query, body);
    let signatures = params::require_signatures(&request)?;
    let build_graph = params::bool_param(&request, "buildGraph");

    let mut transactions = Vec::with_capacity(signatures.len());
    for signature in &signatures {
        let resolved = state.upstream.get_transaction(signature).await?;
        transactions.push(match resolved {
            Some(tx) => json!({
                "signature": signature,
                "found": true,
                "blockTime": tx.block_time,
                "slot": tx.slot,
                "fee": tx.fee,
                "success": tx.success,
            }),
            None => json!({ "signature": signature, "found": false }),
        });
    }

    let mut body = json!({
        "count": signatures.len(),
        "transactions": transactions,
    });

    if build_graph {
        let enhanced = state.upstream.get_enhanced_transactions(&signatures).await?;
        let mut edges: Vec<Transfer> = Vec::new();
        for tx in &enhanced {
            let mints: HashSet<&str> = tx.token_transfers.iter().map(|t| t.mint.as_str()).collect();
            for mint in mints {
                edges.extend(classifier::transfers_for_mint(tx, mint));
            }
        }

        // Best-effort ingestion so later traversals can reuse the edges.
        for tx in &enhanced {
            if let Ok(Some(parsed)) = state.upstream.get_transaction(&tx.signature).await {
                let tx_transfers: Vec<Transfer> = edges
                    .iter()
                    .filter(|t| t.signature == tx.signature)
                    .cloned()
                    .collect();
                if let Err(e) = state.store.ingest_transaction(&parsed, &tx_transfers).await {
                    tracing::warn!(signature = %tx.signature, error = %e, "trace ingestion failed");
                }
            }
        }

        let mut nodes: HashSet<String> = HashSet::new();
        for edge in &edges {
            if !edge.from_address.is_empty() {
                nodes.insert(edge.from_address.clone());
            }
            if !edge.to_address.is_empty() {
                nodes.insert(edge.to_address.clone());
            }
        }
        body["graph"] = json!({
            "nodes": nodes,
            "edges": edges,
        });
    }

    state.gate.record_usage(usage_log(
        &ctx,
        headers,
        "/api/v1/trace",
        "POST",
        StatusCode::OK,
        started,
        request_id,
    ));
    Ok((StatusCode::OK, body, gate_headers))
}

/// POST|GET /api/v1/analyze/token
pub async fn analyze_token(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> Response {
    let result = analyze_token_inner(&state, &headers, &query, body.as_deref(), &request_id.0).await;
    finish(result, &request_id)
}

async fn analyze_token_inner(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Option<&Value>,
    request_id: &str,
) -> Result<(StatusCode, Value, GateHeaders), ApiError> {
    let started = Instant::now();
    let (ctx, gate_headers) = state.authorize_request(headers).await?;

    let request = params::normalize(query, body);
    let token = params::require_token(&request)?;
    let limit = params::limit(&request)?;

    let transfers = state.upstream.get_recent_token_activity(&token, limit).await?;
    let pools = classifier::detect_pool_hubs(&transfers);

    let swaps = transfers.iter().filter(|t| t.tx_type == TxType::Swap).count();
    let buys = transfers
        .iter()
        .filter(|t| t.swap_direction == Some(crate::upstream::SwapDirection::Buy))
        .count();
    let sells = transfers
        .iter()
        .filter(|t| t.swap_direction == Some(crate::upstream::SwapDirection::Sell))
        .count();

    let mut nodes: Vec<Value> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for transfer in &transfers {
        for address in [transfer.from_address.as_str(), transfer.to_address.as_str()] {
            if address.is_empty() || !seen.insert(address) {
                continue;
            }
            let kind = if pools.contains(address) {
                EntityKind::Pool
            } else {
                EntityKind::Wallet
            };
            nodes.push(json!({ "address": address, "kind": kind }));
        }
    }

    let body = json!({
        "token": token,
        "summary": {
            "transferCount": transfers.len(),
            "swapCount": swaps,
            "buyCount": buys,
            "sellCount": sells,
            "poolCount": pools.len(),
        },
        "transfers": transfers,
        "graph": { "nodes": nodes },
    });
    state.gate.record_usage(usage_log(
        &ctx,
        headers,
        "/api/v1/analyze/token",
        "POST",
        StatusCode::OK,
        started,
        request_id,
    ));
    Ok((StatusCode::OK, body, gate_headers))
}

/// Convert a handler outcome into the final response with the request id.
fn finish(
    result: Result<(StatusCode, Value, GateHeaders), ApiError>,
    request_id: &RequestId,
) -> Response {
    match result {
        Ok((status, mut body, gate_headers)) => {
            if let Some(object) = body.as_object_mut() {
                object.insert("requestId".into(), json!(request_id.0));
            }
            json_response(status, body, Some(&gate_headers))
        }
        Err(err) => err.into_response_with_id(&request_id.0),
    }
}
