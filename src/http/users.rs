//! Tenant account endpoints.
//!
//! Registration is public (IP-limited); everything else authenticates
//! through the `x-api-key` header. Account endpoints do not consume the
//! monthly quota.

use axum::{
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

use super::middleware::{client_ip, RequestId};
use super::{json_response, params, AppState};
use crate::config::{plan_limits, Plan};
use crate::error::ApiError;
use crate::storage::models::{ApiKeyRecord, Subscription, User};

fn user_json(user: &User) -> Value {
    json!({
        "id": user.id,
        "email": user.email,
        "fullName": user.full_name,
        "companyName": user.company_name,
        "plan": user.plan.as_str(),
        "status": user.status.as_str(),
        "createdAt": user.created_at,
    })
}

fn subscription_json(sub: &Subscription) -> Value {
    json!({
        "plan": sub.plan.as_str(),
        "status": sub.status.as_str(),
        "monthlyQuota": sub.monthly_quota,
        "currentUsage": sub.current_usage,
        "rateLimitPerMinute": sub.rate_limit_per_minute,
        "billingPeriodStart": sub.billing_period_start,
        "billingPeriodEnd": sub.billing_period_end,
        "priceCents": sub.price_cents,
    })
}

fn key_json(key: &ApiKeyRecord) -> Value {
    json!({
        "id": key.id,
        "keyPrefix": key.key_prefix,
        "name": key.name,
        "active": key.active,
        "totalCalls": key.total_calls,
        "createdAt": key.created_at,
        "revokedAt": key.revoked_at,
        "lastUsedAt": key.last_used_at,
    })
}

/// POST /api/v1/users/register (public)
pub async fn register(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let result = register_inner(&state, &headers, body.as_deref()).await;
    finish(result, &request_id)
}

async fn register_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Option<&Value>,
) -> Result<(StatusCode, Value), ApiError> {
    if let Err(retry_after_secs) = state.ip_limiter.check(client_ip(headers)).await {
        state.ip_limiter.cleanup().await;
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let request = params::normalize(&HashMap::new(), body);
    let email = params::str_param(&request, "email")
        .ok_or_else(|| ApiError::InvalidRequest("missing required field: email".into()))?;
    let plan = match params::str_param(&request, "plan") {
        Some(raw) => Plan::parse(&raw)
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown plan: {}", raw)))?,
        None => Plan::Starter,
    };

    let provisioned = state
        .gate
        .provision_tenant(
            &email,
            params::str_param(&request, "fullName"),
            params::str_param(&request, "companyName"),
            plan,
            None,
        )
        .await?;

    // The raw key is shown exactly once, here.
    let body = json!({
        "user": user_json(&provisioned.user),
        "subscription": subscription_json(&provisioned.subscription),
        "apiKey": {
            "id": provisioned.api_key.id,
            "key": provisioned.raw_key,
            "keyPrefix": provisioned.api_key.key_prefix,
        },
    });
    Ok((StatusCode::CREATED, body))
}

/// GET /api/v1/users/me
pub async fn me(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        let ctx = state.authenticate_request(&headers).await?;
        Ok((
            StatusCode::OK,
            json!({
                "user": user_json(&ctx.user),
                "subscription": subscription_json(&ctx.subscription),
            }),
        ))
    }
    .await;
    finish(result, &request_id)
}

/// GET /api/v1/users/usage
pub async fn usage(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        let ctx = state.authenticate_request(&headers).await?;
        let sub = &ctx.subscription;
        Ok((
            StatusCode::OK,
            json!({
                "currentUsage": sub.current_usage,
                "monthlyQuota": sub.monthly_quota,
                "remaining": (sub.monthly_quota - sub.current_usage).max(0),
                "billingPeriodStart": sub.billing_period_start,
                "billingPeriodEnd": sub.billing_period_end,
                "keyTotalCalls": ctx.api_key.total_calls,
            }),
        ))
    }
    .await;
    finish(result, &request_id)
}

/// GET /api/v1/users/keys
pub async fn list_keys(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        let ctx = state.authenticate_request(&headers).await?;
        let keys = state
            .store
            .list_api_keys(ctx.user.id)
            .await
            .map_err(ApiError::Internal)?;
        let keys: Vec<Value> = keys.iter().map(key_json).collect();
        Ok((StatusCode::OK, json!({ "keys": keys })))
    }
    .await;
    finish(result, &request_id)
}

/// POST /api/v1/users/keys
pub async fn create_key(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let result = async {
        let ctx = state.authenticate_request(&headers).await?;
        let request = params::normalize(&HashMap::new(), body.as_deref());
        let name = params::str_param(&request, "name");

        let (record, raw_key) = state.gate.create_key(ctx.user.id, name).await?;
        Ok((
            StatusCode::CREATED,
            json!({
                "id": record.id,
                "key": raw_key,
                "keyPrefix": record.key_prefix,
                "name": record.name,
            }),
        ))
    }
    .await;
    finish(result, &request_id)
}

/// DELETE /api/v1/users/keys/{key_id}
pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Response {
    let result = async {
        let ctx = state.authenticate_request(&headers).await?;
        let key_id: Uuid = key_id
            .parse()
            .map_err(|_| ApiError::InvalidRequest("invalid key id".into()))?;

        let found = state
            .store
            .revoke_api_key(ctx.user.id, key_id, Utc::now())
            .await
            .map_err(ApiError::Internal)?;
        if !found {
            return Err(ApiError::NotFound("unknown API key".into()));
        }
        Ok((StatusCode::OK, json!({ "revoked": true, "id": key_id })))
    }
    .await;
    finish(result, &request_id)
}

/// POST /api/v1/users/plan
pub async fn change_plan(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let result = async {
        let ctx = state.authenticate_request(&headers).await?;
        let request = params::normalize(&HashMap::new(), body.as_deref());
        let plan = params::str_param(&request, "plan")
            .and_then(|p| Plan::parse(&p))
            .ok_or_else(|| ApiError::InvalidRequest("missing or unknown plan".into()))?;

        state
            .store
            .change_plan(ctx.user.id, plan, plan_limits(plan))
            .await
            .map_err(ApiError::Internal)?;

        let subscription = state
            .store
            .active_subscription(ctx.user.id)
            .await
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::NotFound("no active subscription".into()))?;
        Ok((StatusCode::OK, json!({ "subscription": subscription_json(&subscription) })))
    }
    .await;
    finish(result, &request_id)
}

/// POST /api/v1/users/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        let ctx = state.authenticate_request(&headers).await?;
        state
            .store
            .cancel_subscription(ctx.user.id, Utc::now())
            .await
            .map_err(ApiError::Internal)?;
        Ok((StatusCode::OK, json!({ "status": "cancelled" })))
    }
    .await;
    finish(result, &request_id)
}

fn finish(result: Result<(StatusCode, Value), ApiError>, request_id: &RequestId) -> Response {
    match result {
        Ok((status, mut body)) => {
            if let Some(object) = body.as_object_mut() {
                object.insert("requestId".into(), json!(request_id.0));
            }
            json_response(status, body, None)
        }
        Err(err) => err.into_response_with_id(&request_id.0),
    }
}
