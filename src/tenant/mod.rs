//! Tenant gate: authentication, quota and rate enforcement, provisioning.
//!
//! Authentication is one parameterized lookup joining the active key with
//! its user and active subscription. Misses are padded to a fixed latency
//! floor so key existence cannot be probed through response timing. Usage
//! accounting is fired on detached tasks after the authorization decision
//! and survives client disconnects; the design tolerates the resulting
//! plus/minus one per burst.

pub mod apikey;
pub mod rate_limit;
pub mod webhook;

use axum::http::{HeaderMap, HeaderValue};
use chrono::{Months, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::config::{plan_limits, Plan};
use crate::error::ApiError;
use crate::storage::models::{
    AccountStatus, ApiKeyRecord, ApiUsageLog, AuthContext, Subscription, User,
};
use crate::storage::Store;
use rate_limit::{KeyRateLimiter, RateDecision};

/// Minimum latency of a failed authentication.
const AUTH_LATENCY_FLOOR: Duration = Duration::from_millis(50);

/// A freshly provisioned tenant. `raw_key` exists only in memory and in
/// the response that hands it to its owner.
#[derive(Debug)]
pub struct ProvisionedTenant {
    pub user: User,
    pub subscription: Subscription,
    pub api_key: ApiKeyRecord,
    pub raw_key: String,
}

/// Rate and quota state echoed on every authenticated response.
#[derive(Debug, Clone, Copy)]
pub struct GateHeaders {
    pub rate: RateDecision,
    pub quota_limit: i64,
    pub quota_remaining: i64,
    pub quota_reset_at: i64,
}

impl GateHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) {
        let mut set = |name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(name, v);
            }
        };
        set("x-ratelimit-limit", self.rate.limit.to_string());
        set("x-ratelimit-remaining", self.rate.remaining.to_string());
        set("x-ratelimit-reset", self.rate.reset_at.to_string());
        set("x-quota-limit", self.quota_limit.to_string());
        set("x-quota-remaining", self.quota_remaining.to_string());
        set("x-quota-reset", self.quota_reset_at.to_string());
    }
}

/// Process-wide tenant gate.
pub struct TenantGate {
    store: Arc<dyn Store>,
    salt: String,
    limiter: KeyRateLimiter,
}

impl TenantGate {
    pub fn new(store: Arc<dyn Store>, salt: String, limiter: KeyRateLimiter) -> Self {
        Self { store, salt, limiter }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Authenticate a raw API key. Negative outcomes take at least the
    /// latency floor regardless of where they failed.
    pub async fn authenticate(&self, raw_key: &str) -> Result<AuthContext, ApiError> {
        let started = Instant::now();

        let context = if apikey::has_valid_shape(raw_key) {
            let key_hash = apikey::hash_key(&self.salt, raw_key);
            self.store
                .find_auth_context(&key_hash)
                .await
                .map_err(ApiError::Internal)?
        } else {
            None
        };

        // Expired keys fail exactly like unknown ones.
        let context = context
            .filter(|ctx| ctx.api_key.expires_at.is_none_or(|t| t > Utc::now()));

        match context {
            Some(ctx) => {
                let store = Arc::clone(&self.store);
                let key_id = ctx.api_key.id;
                tokio::spawn(async move {
                    if let Err(e) = store.touch_api_key(key_id, Utc::now()).await {
                        warn!(key_id = %key_id, error = %e, "failed to touch api key");
                    }
                });
                Ok(ctx)
            }
            None => {
                let elapsed = started.elapsed();
                if elapsed < AUTH_LATENCY_FLOOR {
                    sleep(AUTH_LATENCY_FLOOR - elapsed).await;
                }
                Err(ApiError::Unauthenticated("invalid API key".into()))
            }
        }
    }

    /// Enforce subscription state, monthly quota, then the per-minute
    /// rate limit. On success the usage increment is fired detached.
    pub async fn authorize(&self, ctx: &AuthContext) -> Result<GateHeaders, ApiError> {
        let sub = &ctx.subscription;

        if sub.status != AccountStatus::Active {
            return Err(ApiError::SubscriptionInactive {
                status: sub.status.as_str().to_string(),
            });
        }

        if sub.current_usage >= sub.monthly_quota {
            return Err(ApiError::QuotaExceeded { reset_at: sub.billing_period_end });
        }

        let rate = self
            .limiter
            .check(ctx.api_key.id, sub.rate_limit_per_minute)
            .await;
        if !rate.allowed {
            return Err(ApiError::RateLimited { retry_after_secs: rate.retry_after_secs });
        }

        let store = Arc::clone(&self.store);
        let subscription_id = sub.id;
        let key_id = ctx.api_key.id;
        tokio::spawn(async move {
            if let Err(e) = store.record_successful_call(subscription_id, key_id).await {
                warn!(key_id = %key_id, error = %e, "usage increment failed");
            }
        });

        Ok(GateHeaders {
            rate,
            quota_limit: sub.monthly_quota,
            // The detached increment lands after this read.
            quota_remaining: (sub.monthly_quota - sub.current_usage - 1).max(0),
            quota_reset_at: sub.billing_period_end.timestamp(),
        })
    }

    /// Append one usage-log row on a detached task.
    pub fn record_usage(&self, log: ApiUsageLog) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.insert_usage_log(log).await {
                warn!(error = %e, "usage log append failed");
            }
        });
    }

    /// Create user + subscription + first API key atomically.
    ///
    /// Returns `Conflict` for a duplicate email. Webhook callers handle
    /// their own external-id idempotency before calling this.
    pub async fn provision_tenant(
        &self,
        email: &str,
        full_name: Option<String>,
        company_name: Option<String>,
        plan: Plan,
        external_user_id: Option<String>,
    ) -> Result<ProvisionedTenant, ApiError> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(ApiError::InvalidRequest("invalid email address".into()));
        }

        if self
            .store
            .find_user_by_email(&email)
            .await
            .map_err(ApiError::Internal)?
            .is_some()
        {
            return Err(ApiError::Conflict("email is already registered".into()));
        }

        let now = Utc::now();
        let limits = plan_limits(plan);
        let user = User {
            id: Uuid::new_v4(),
            email,
            full_name,
            company_name,
            plan,
            status: AccountStatus::Active,
            external_user_id,
            created_at: now,
            last_login_at: None,
        };
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: user.id,
            plan,
            monthly_quota: limits.monthly_quota,
            rate_limit_per_minute: limits.rate_limit_per_minute,
            current_usage: 0,
            billing_period_start: now,
            billing_period_end: now
                .checked_add_months(Months::new(1))
                .unwrap_or(now),
            status: AccountStatus::Active,
            price_cents: limits.price_cents,
            cancelled_at: None,
        };

        let (api_key, raw_key) = self.new_key_record(user.id, None);
        self.store
            .create_tenant(user.clone(), subscription.clone(), api_key.clone())
            .await
            .map_err(|e| {
                // The store enforces email uniqueness as well.
                if e.to_string().contains("duplicate") {
                    ApiError::Conflict("email is already registered".into())
                } else {
                    ApiError::Internal(e)
                }
            })?;

        Ok(ProvisionedTenant { user, subscription, api_key, raw_key })
    }

    /// Issue an additional key for an existing user.
    pub async fn create_key(
        &self,
        user_id: Uuid,
        name: Option<String>,
    ) -> Result<(ApiKeyRecord, String), ApiError> {
        let (record, raw_key) = self.new_key_record(user_id, name);
        self.store
            .insert_api_key(record.clone())
            .await
            .map_err(ApiError::Internal)?;
        Ok((record, raw_key))
    }

    fn new_key_record(&self, user_id: Uuid, name: Option<String>) -> (ApiKeyRecord, String) {
        let raw_key = apikey::generate_key();
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            user_id,
            key_hash: apikey::hash_key(&self.salt, &raw_key),
            key_prefix: apikey::display_prefix(&raw_key),
            name,
            active: true,
            total_calls: 0,
            created_at: Utc::now(),
            revoked_at: None,
            expires_at: None,
            last_used_at: None,
        };
        (record, raw_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KvCache;
    use crate::storage::MemoryStore;

    const SALT: &str = "unit-test-salt-of-sufficient-length!";

    fn gate(store: Arc<MemoryStore>) -> TenantGate {
        TenantGate::new(
            store,
            SALT.to_string(),
            KeyRateLimiter::new(KvCache::disabled()),
        )
    }

    #[tokio::test]
    async fn authentication_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store);
        let provisioned = gate
            .provision_tenant("User@Example.com", None, None, Plan::Starter, None)
            .await
            .unwrap();
        assert_eq!(provisioned.user.email, "user@example.com");

        let ctx = gate.authenticate(&provisioned.raw_key).await.unwrap();
        assert_eq!(ctx.user.id, provisioned.user.id);
    }

    #[tokio::test]
    async fn failed_auth_is_padded_to_the_latency_floor() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store);

        let started = Instant::now();
        let err = gate
            .authenticate(&format!("tfa_live_{}", "0".repeat(64)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(_)));
        assert!(started.elapsed() >= AUTH_LATENCY_FLOOR);

        // Malformed keys pay the same floor.
        let started = Instant::now();
        let _ = gate.authenticate("not-a-key").await.unwrap_err();
        assert!(started.elapsed() >= AUTH_LATENCY_FLOOR);
    }

    #[tokio::test]
    async fn quota_exhaustion_rejects_with_reset() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store.clone());
        let provisioned = gate
            .provision_tenant("q@example.com", None, None, Plan::Starter, None)
            .await
            .unwrap();

        // Burn the whole quota.
        for _ in 0..provisioned.subscription.monthly_quota {
            store
                .record_successful_call(provisioned.subscription.id, provisioned.api_key.id)
                .await
                .unwrap();
        }

        let ctx = gate.authenticate(&provisioned.raw_key).await.unwrap();
        let err = gate.authorize(&ctx).await.unwrap_err();
        match err {
            ApiError::QuotaExceeded { reset_at } => {
                assert_eq!(reset_at, ctx.subscription.billing_period_end);
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn authorize_emits_rate_and_quota_headers() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store);
        let provisioned = gate
            .provision_tenant("h@example.com", None, None, Plan::Pro, None)
            .await
            .unwrap();

        let ctx = gate.authenticate(&provisioned.raw_key).await.unwrap();
        let headers = gate.authorize(&ctx).await.unwrap();
        assert_eq!(headers.rate.limit, 60);
        assert_eq!(headers.quota_limit, 10_000);
        assert_eq!(headers.quota_remaining, 9_999);

        let mut map = HeaderMap::new();
        headers.apply(&mut map);
        assert_eq!(map.get("x-ratelimit-limit").unwrap(), "60");
        assert_eq!(map.get("x-quota-remaining").unwrap(), "9999");
    }

    #[tokio::test]
    async fn revoked_key_no_longer_authenticates() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store.clone());
        let provisioned = gate
            .provision_tenant("r@example.com", None, None, Plan::Starter, None)
            .await
            .unwrap();

        store
            .revoke_api_key(provisioned.user.id, provisioned.api_key.id, Utc::now())
            .await
            .unwrap();
        assert!(gate.authenticate(&provisioned.raw_key).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store);
        gate.provision_tenant("dup@example.com", None, None, Plan::Starter, None)
            .await
            .unwrap();
        let err = gate
            .provision_tenant("dup@example.com", None, None, Plan::Pro, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }
}
