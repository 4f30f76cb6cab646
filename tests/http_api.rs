//! End-to-end HTTP surface tests over the in-memory store.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::json;
use tower::ServiceExt;

use tokenflow::storage::{MemoryStore, Store};

use common::{get_request, json_request, send, test_app, transfer, ScriptedUpstream};

const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

fn addr(c: char) -> String {
    std::iter::repeat(c).take(40).collect()
}

/// Register a tenant and hand back its raw API key.
async fn register(app: &axum::Router, email: &str, plan: &str) -> String {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/api/v1/users/register",
            None,
            json!({ "email": email, "plan": plan }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
    body["apiKey"]["key"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let (app, _state) = test_app(Arc::new(MemoryStore::new()), Arc::new(ScriptedUpstream::new()));
    let (status, body) = send(&app, get_request("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache"], "disabled");
}

#[tokio::test]
async fn register_returns_the_raw_key_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let (app, _state) = test_app(store.clone(), Arc::new(ScriptedUpstream::new()));

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/api/v1/users/register",
            None,
            json!({ "email": "New@User.io", "fullName": "New User" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let raw_key = body["apiKey"]["key"].as_str().unwrap();
    assert!(raw_key.starts_with("tfa_live_"));
    assert_eq!(raw_key.len(), 9 + 64);
    assert_eq!(body["user"]["email"], "new@user.io");
    assert_eq!(body["subscription"]["plan"], "starter");

    // The raw key is nowhere in the store.
    let user = store.find_user_by_email("new@user.io").await.unwrap().unwrap();
    let keys = store.list_api_keys(user.id).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_ne!(keys[0].key_hash, raw_key);
    assert!(!keys[0].key_hash.contains(raw_key));

    // Duplicate registration conflicts.
    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/api/v1/users/register",
            None,
            json!({ "email": "new@user.io" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn authed_endpoints_reject_missing_or_bogus_keys() {
    let (app, _state) = test_app(Arc::new(MemoryStore::new()), Arc::new(ScriptedUpstream::new()));

    let (status, body) = send(&app, get_request("/api/v1/users/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["request_id"].is_string());

    let bogus = format!("tfa_live_{}", "0".repeat(64));
    let (status, _) = send(&app, get_request("/api/v1/users/me", Some(&bogus))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn analyze_path_reconstructs_over_http() {
    let now = Utc::now().timestamp();
    let a = addr('A');
    let b = addr('B');
    let upstream =
        ScriptedUpstream::new().with_transfer(transfer("s1", &a, &b, MINT, 1_000_000, now - 60));

    let store = Arc::new(MemoryStore::new());
    let (app, _state) = test_app(store.clone(), Arc::new(upstream));
    let key = register(&app, "path@test.io", "pro").await;

    let request = json_request(
        "POST",
        "/api/v1/analyze/path",
        Some(&key),
        json!({
            "address": a,
            "tokenAddress": MINT,
            "direction": "forward",
            "maxDepth": 5,
            "timeRange": "30d",
        }),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Rate and quota headers ride on successful responses too.
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "60");
    assert!(response.headers().contains_key("x-quota-remaining"));
    assert!(response.headers().contains_key("x-request-id"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["pathCount"], 1);
    assert_eq!(body["paths"][0]["hop_count"], 2);
    assert_eq!(body["paths"][0]["total_amount"], "2000000");

    // The detached usage log lands shortly after the response.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let logs = store.usage_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].endpoint, "/api/v1/analyze/path");
    assert_eq!(logs[0].status_code, 200);
}

#[tokio::test]
async fn quota_exhaustion_returns_429_with_reset() {
    let store = Arc::new(MemoryStore::new());
    let (app, _state) = test_app(store.clone(), Arc::new(ScriptedUpstream::new()));
    let key = register(&app, "quota@test.io", "starter").await;

    let user = store.find_user_by_email("quota@test.io").await.unwrap().unwrap();
    let sub = store.active_subscription(user.id).await.unwrap().unwrap();
    let keys = store.list_api_keys(user.id).await.unwrap();
    for _ in 0..sub.monthly_quota {
        store.record_successful_call(sub.id, keys[0].id).await.unwrap();
    }

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/api/v1/analyze/path",
            Some(&key),
            json!({ "address": addr('A'), "token": MINT }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    let reset: chrono::DateTime<Utc> =
        serde_json::from_value(body["reset_at"].clone()).expect("reset timestamp");
    assert_eq!(reset, sub.billing_period_end);
}

#[tokio::test]
async fn per_minute_rate_limit_kicks_in() {
    let now = Utc::now().timestamp();
    let a = addr('A');
    let upstream = ScriptedUpstream::new().with_transfer(transfer(
        "s1", &a, &addr('B'), MINT, 100, now - 60,
    ));
    let (app, _state) = test_app(Arc::new(MemoryStore::new()), Arc::new(upstream));
    // starter: 10 requests per minute
    let key = register(&app, "rate@test.io", "starter").await;

    let request = || {
        json_request(
            "POST",
            "/api/v1/analyze/path",
            Some(&key),
            json!({ "address": a, "token": MINT }),
        )
    };
    for _ in 0..10 {
        let (status, _) = send(&app, request()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn out_of_range_time_range_is_a_400() {
    let (app, _state) = test_app(Arc::new(MemoryStore::new()), Arc::new(ScriptedUpstream::new()));
    let key = register(&app, "range@test.io", "pro").await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/api/v1/analyze/path",
            Some(&key),
            json!({ "address": addr('A'), "token": MINT, "timeRange": "366d" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn oversized_trace_batch_fails_before_any_upstream_call() {
    let (app, _state) = test_app(Arc::new(MemoryStore::new()), Arc::new(ScriptedUpstream::new()));
    let key = register(&app, "trace@test.io", "pro").await;

    // 101 well-formed signatures: the batch bound trips first. The wired
    // upstream URL is unroutable, so reaching it would error differently.
    let signatures: Vec<String> = (0..101).map(|_| "5".repeat(88)).collect();
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/api/v1/trace",
            Some(&key),
            json!({ "signatures": signatures }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn key_lifecycle_over_http() {
    let store = Arc::new(MemoryStore::new());
    let (app, _state) = test_app(store.clone(), Arc::new(ScriptedUpstream::new()));
    let key = register(&app, "keys@test.io", "pro").await;

    // Issue a second key.
    let (status, body) = send(
        &app,
        json_request("POST", "/api/v1/users/keys", Some(&key), json!({ "name": "ci" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let second_raw = body["key"].as_str().unwrap().to_string();
    let second_id = body["id"].as_str().unwrap().to_string();
    assert!(second_raw.starts_with("tfa_live_"));

    let (status, body) = send(&app, get_request("/api/v1/users/keys", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"].as_array().unwrap().len(), 2);

    // Revoke the second key; it stops authenticating, revoking again is
    // still a success for the owner.
    let uri = format!("/api/v1/users/keys/{}", second_id);
    let revoke = || {
        Request::builder()
            .method("DELETE")
            .uri(uri.clone())
            .header("x-api-key", key.clone())
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app, revoke()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, revoke()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, get_request("/api/v1/users/me", Some(&second_raw))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn plan_change_and_cancel_over_http() {
    let store = Arc::new(MemoryStore::new());
    let (app, _state) = test_app(store.clone(), Arc::new(ScriptedUpstream::new()));
    let key = register(&app, "plan@test.io", "starter").await;

    let (status, body) = send(
        &app,
        json_request("POST", "/api/v1/users/plan", Some(&key), json!({ "plan": "enterprise" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["monthlyQuota"], 100_000);

    let (status, _) = send(
        &app,
        json_request("POST", "/api/v1/users/cancel", Some(&key), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The cancelled subscription falls out of the auth join.
    let (status, _) = send(&app, get_request("/api/v1/users/me", Some(&key))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn usage_endpoint_reports_the_window() {
    let store = Arc::new(MemoryStore::new());
    let (app, _state) = test_app(store.clone(), Arc::new(ScriptedUpstream::new()));
    let key = register(&app, "usage@test.io", "pro").await;

    let (status, body) = send(&app, get_request("/api/v1/users/usage", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["monthlyQuota"], 10_000);
    assert_eq!(body["currentUsage"], 0);
    assert_eq!(body["remaining"], 10_000);
}
