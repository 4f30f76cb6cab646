//! Marketplace webhook verification and tenant lifecycle.
//!
//! Every event is verified against `hex(HMAC-SHA256(secret, raw_body))`
//! with a constant-time comparison and a five-minute replay window, then
//! appended to the audit log before any handling. Handler failures leave
//! the audit row unprocessed with the error captured, so the marketplace
//! can redeliver and converge.
//!
//! Payload field names are normalized with camelCase, then snake_case,
//! then Title Case priority.

use chrono::{Months, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::TenantGate;
use crate::config::{plan_limits, Plan};
use crate::error::ApiError;
use crate::storage::models::{User, WebhookEventRecord};
use crate::storage::Store;

type HmacSha256 = Hmac<Sha256>;

/// Replay window for webhook timestamps.
const REPLAY_WINDOW_SECS: i64 = 300;
/// Audit source tag.
const SOURCE: &str = "apix";

/// Verify a webhook signature in constant time.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body. Test and tooling helper.
pub fn sign_body(secret: &str, raw_body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

/// Pick a payload field by camelCase name, falling back to its
/// snake_case and Title Case spellings, in that order.
pub fn pick<'a>(obj: &'a Value, camel: &str) -> Option<&'a Value> {
    if let Some(v) = obj.get(camel) {
        return Some(v);
    }
    if let Some(v) = obj.get(camel_to_snake(camel)) {
        return Some(v);
    }
    obj.get(camel_to_title(camel))
}

fn pick_str(obj: &Value, camel: &str) -> Option<String> {
    pick(obj, camel).and_then(Value::as_str).map(str::to_string)
}

fn camel_words(camel: &str) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in camel.chars() {
        if c.is_ascii_uppercase() && !current.is_empty() {
            words.push(current.clone());
            current.clear();
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn camel_to_snake(camel: &str) -> String {
    camel_words(camel).join("_")
}

fn camel_to_title(camel: &str) -> String {
    camel_words(camel)
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// HTTP-shaped outcome of one processed event.
#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub status: u16,
    pub body: Value,
}

/// Processes signed marketplace events against the tenant store.
pub struct WebhookProcessor {
    gate: Arc<TenantGate>,
    store: Arc<dyn Store>,
    secret: String,
}

impl WebhookProcessor {
    pub fn new(gate: Arc<TenantGate>, secret: String) -> Self {
        let store = gate.store();
        Self { gate, store, secret }
    }

    /// Verify, audit and dispatch one raw webhook delivery.
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<WebhookOutcome, ApiError> {
        let signature = signature_header
            .ok_or_else(|| ApiError::Unauthenticated("missing webhook signature".into()))?;
        if !verify_signature(&self.secret, raw_body, signature) {
            return Err(ApiError::Unauthenticated("invalid webhook signature".into()));
        }

        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|_| ApiError::InvalidRequest("webhook body is not valid JSON".into()))?;

        let timestamp = pick(&payload, "timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| ApiError::InvalidRequest("missing webhook timestamp".into()))?;
        // Millisecond timestamps are normalized to seconds.
        let timestamp = if timestamp > 1_000_000_000_000 { timestamp / 1000 } else { timestamp };
        if Utc::now().timestamp() - timestamp > REPLAY_WINDOW_SECS {
            return Err(ApiError::Unauthenticated("webhook timestamp too old".into()));
        }

        let event_type = pick_str(&payload, "event")
            .or_else(|| pick_str(&payload, "eventType"))
            .ok_or_else(|| ApiError::InvalidRequest("missing event type".into()))?;

        // Receipt is logged before handling.
        let event_id = Uuid::new_v4();
        let record = WebhookEventRecord {
            id: event_id,
            source: SOURCE.into(),
            event_type: event_type.clone(),
            payload: payload.clone(),
            received_at: Utc::now(),
            processed: false,
            processed_at: None,
            error_message: None,
        };
        self.store
            .insert_webhook_event(record)
            .await
            .map_err(ApiError::Internal)?;

        let empty = Value::Null;
        let data = pick(&payload, "data").unwrap_or(&empty);

        let result = match event_type.as_str() {
            "user.subscribed" => self.handle_subscribed(data).await,
            "user.plan_changed" => self.handle_plan_changed(data).await,
            "user.cancelled" => self.handle_cancelled(data).await,
            "user.renewed" => self.handle_renewed(data).await,
            other => Err(ApiError::InvalidRequest(format!("unknown event: {}", other))),
        };

        match result {
            Ok(outcome) => {
                if let Err(e) = self
                    .store
                    .mark_webhook_event(event_id, true, None, Utc::now())
                    .await
                {
                    warn!(event_id = %event_id, error = %e, "webhook audit update failed");
                }
                info!(event = %event_type, status = outcome.status, "webhook processed");
                Ok(outcome)
            }
            Err(err) => {
                if let Err(e) = self
                    .store
                    .mark_webhook_event(event_id, false, Some(err.to_string()), Utc::now())
                    .await
                {
                    warn!(event_id = %event_id, error = %e, "webhook audit update failed");
                }
                Err(err)
            }
        }
    }

    async fn require_user(&self, data: &Value) -> Result<User, ApiError> {
        let external_id = pick_str(data, "externalUserId")
            .ok_or_else(|| ApiError::InvalidRequest("missing externalUserId".into()))?;
        self.store
            .find_user_by_external_id(&external_id)
            .await
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown external user: {}", external_id)))
    }

    async fn handle_subscribed(&self, data: &Value) -> Result<WebhookOutcome, ApiError> {
        let external_id = pick_str(data, "externalUserId")
            .ok_or_else(|| ApiError::InvalidRequest("missing externalUserId".into()))?;

        // Redelivery converges on the already-created tenant.
        if let Some(existing) = self
            .store
            .find_user_by_external_id(&external_id)
            .await
            .map_err(ApiError::Internal)?
        {
            return Ok(WebhookOutcome {
                status: 200,
                body: serde_json::json!({
                    "userId": existing.id,
                    "alreadyExists": true,
                }),
            });
        }

        let email = pick_str(data, "email")
            .ok_or_else(|| ApiError::InvalidRequest("missing email".into()))?;

        if let Some(existing) = self
            .store
            .find_user_by_email(&email.trim().to_ascii_lowercase())
            .await
            .map_err(ApiError::Internal)?
        {
            return Ok(WebhookOutcome {
                status: 200,
                body: serde_json::json!({
                    "userId": existing.id,
                    "alreadyExists": true,
                }),
            });
        }

        let plan = pick_str(data, "plan")
            .and_then(|p| Plan::parse(&p))
            .unwrap_or(Plan::Starter);

        let provisioned = self
            .gate
            .provision_tenant(
                &email,
                pick_str(data, "fullName"),
                pick_str(data, "companyName"),
                plan,
                Some(external_id),
            )
            .await?;

        // Only the prefix leaves through the webhook channel.
        Ok(WebhookOutcome {
            status: 201,
            body: serde_json::json!({
                "userId": provisioned.user.id,
                "subscription": {
                    "plan": provisioned.subscription.plan.as_str(),
                    "monthlyQuota": provisioned.subscription.monthly_quota,
                    "status": provisioned.subscription.status.as_str(),
                },
                "apiKey": {
                    "keyPrefix": provisioned.api_key.key_prefix,
                },
            }),
        })
    }

    async fn handle_plan_changed(&self, data: &Value) -> Result<WebhookOutcome, ApiError> {
        let user = self.require_user(data).await?;
        let plan = pick_str(data, "plan")
            .and_then(|p| Plan::parse(&p))
            .ok_or_else(|| ApiError::InvalidRequest("missing or unknown plan".into()))?;

        self.store
            .change_plan(user.id, plan, plan_limits(plan))
            .await
            .map_err(ApiError::Internal)?;

        Ok(WebhookOutcome {
            status: 200,
            body: serde_json::json!({ "userId": user.id, "plan": plan.as_str() }),
        })
    }

    async fn handle_cancelled(&self, data: &Value) -> Result<WebhookOutcome, ApiError> {
        let user = self.require_user(data).await?;
        self.store
            .cancel_subscription(user.id, Utc::now())
            .await
            .map_err(ApiError::Internal)?;
        Ok(WebhookOutcome {
            status: 200,
            body: serde_json::json!({ "userId": user.id, "status": "cancelled" }),
        })
    }

    async fn handle_renewed(&self, data: &Value) -> Result<WebhookOutcome, ApiError> {
        let user = self.require_user(data).await?;
        let start = Utc::now();
        let end = start.checked_add_months(Months::new(1)).unwrap_or(start);
        self.store
            .renew_subscription(user.id, start, end)
            .await
            .map_err(ApiError::Internal)?;
        Ok(WebhookOutcome {
            status: 200,
            body: serde_json::json!({ "userId": user.id, "status": "active" }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = "webhook-secret-of-sufficient-length!";
        let body = br#"{"event":"user.subscribed"}"#;
        let signature = sign_body(secret, body);
        assert!(verify_signature(secret, body, &signature));
        assert!(!verify_signature(secret, b"tampered", &signature));
        assert!(!verify_signature("other-secret-of-sufficient-length", body, &signature));
        assert!(!verify_signature(secret, body, "not-hex"));
    }

    #[test]
    fn field_pick_priority() {
        let payload = serde_json::json!({
            "external_user_id": "snake",
            "External User Id": "title",
        });
        assert_eq!(
            pick(&payload, "externalUserId").and_then(Value::as_str),
            Some("snake")
        );

        let payload = serde_json::json!({
            "externalUserId": "camel",
            "external_user_id": "snake",
        });
        assert_eq!(
            pick(&payload, "externalUserId").and_then(Value::as_str),
            Some("camel")
        );

        let payload = serde_json::json!({ "External User Id": "title" });
        assert_eq!(
            pick(&payload, "externalUserId").and_then(Value::as_str),
            Some("title")
        );
    }

    #[test]
    fn camel_case_derivations() {
        assert_eq!(camel_to_snake("externalUserId"), "external_user_id");
        assert_eq!(camel_to_title("externalUserId"), "External User Id");
        assert_eq!(camel_to_snake("plan"), "plan");
        assert_eq!(camel_to_title("companyName"), "Company Name");
    }
}
