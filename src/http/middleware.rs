//! Request middleware: correlation ids, security headers, the production
//! HTTPS gate and IP-based limiting for the unauthenticated endpoints.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::AppState;

/// Correlation id attached to every request and echoed back.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Per-request context: id echo, HTTPS enforcement, security headers and
/// the access log line.
pub async fn request_context(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Plain HTTP is refused in production; the proxy sets the protocol.
    if state.config.production {
        let proto = request
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        if !proto.eq_ignore_ascii_case("https") {
            let body = Json(serde_json::json!({
                "error": "https_required",
                "message": "plain HTTP is not accepted",
                "request_id": request_id,
            }));
            let mut response = (StatusCode::FORBIDDEN, body).into_response();
            apply_response_headers(&mut response, &request_id);
            return response;
        }
    }

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let started = Instant::now();
    let mut response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis();

    apply_response_headers(&mut response, &request_id);
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed_ms as u64,
        request_id = %request_id,
        "request completed"
    );
    response
}

fn apply_response_headers(response: &mut Response, request_id: &str) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", v);
    }
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
}

/// IP-based rate limiter for the unauthenticated endpoints.
pub struct IpRateLimiter {
    /// Rate limiters per IP address
    limiters:
        Arc<RwLock<HashMap<IpAddr, (RateLimiter<NotKeyed, InMemoryState, DefaultClock>, Instant)>>>,
    /// Requests per minute
    quota: NonZeroU32,
    /// Entries idle longer than this are dropped by cleanup
    idle_cutoff: Duration,
}

impl IpRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            limiters: Arc::new(RwLock::new(HashMap::new())),
            quota: NonZeroU32::new(requests_per_minute)
                .unwrap_or_else(|| NonZeroU32::new(60).expect("nonzero")),
            idle_cutoff: Duration::from_secs(300),
        }
    }

    /// Check one request. Returns the retry-after seconds when limited.
    pub async fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let mut limiters = self.limiters.write().await;

        let (limiter, last_access) = limiters.entry(ip).or_insert_with(|| {
            (RateLimiter::direct(Quota::per_minute(self.quota)), Instant::now())
        });
        *last_access = Instant::now();

        match limiter.check() {
            Ok(_) => Ok(()),
            Err(not_until) => {
                use governor::clock::Clock;
                let now = DefaultClock::default().now();
                Err(not_until.wait_time_from(now).as_secs().max(1))
            }
        }
    }

    /// Drop idle entries. Called opportunistically by the register path.
    pub async fn cleanup(&self) {
        let mut limiters = self.limiters.write().await;
        let cutoff = Instant::now() - self.idle_cutoff;
        limiters.retain(|_, (_, last_access)| *last_access > cutoff);
    }
}

/// Best-effort client IP: first x-forwarded-for hop, else unspecified.
pub fn client_ip(headers: &axum::http::HeaderMap) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(IpAddr::from([0, 0, 0, 0]))
}
