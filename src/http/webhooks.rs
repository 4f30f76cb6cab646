//! Marketplace webhook endpoint.
//!
//! Signature verification needs the raw body bytes, so this handler
//! bypasses the JSON extractor and hands the untouched payload to the
//! processor.

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::json;

use super::middleware::RequestId;
use super::{json_response, AppState};
use crate::error::ApiError;

/// POST /webhooks/apix
pub async fn apix(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return ApiError::InvalidRequest("content-type must be application/json".into())
            .into_response_with_id(&request_id.0);
    }

    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok());

    match state.webhooks.process(&body, signature).await {
        Ok(outcome) => {
            let mut body = outcome.body;
            if let Some(object) = body.as_object_mut() {
                object.insert("requestId".into(), json!(request_id.0));
            }
            let status =
                StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK);
            json_response(status, body, None)
        }
        Err(err) => err.into_response_with_id(&request_id.0),
    }
}
