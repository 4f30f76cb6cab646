//! Deterministic in-memory store.
//!
//! Backs the test suites and storage-less development setups with the
//! same `Store` contract as the relational implementation.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{
    AccountStatus, ApiKeyRecord, ApiUsageLog, AuthContext, Entity, EntityKind, RiskFlag,
    RiskLevel, Subscription, User, WebhookEventRecord,
};
use super::Store;
use crate::config::{Plan, PlanLimits};
use crate::graph::types::FlowPath;
use crate::upstream::types::{ParsedTransaction, Transfer};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    subscriptions: HashMap<Uuid, Subscription>,
    api_keys: HashMap<Uuid, ApiKeyRecord>,
    usage_logs: Vec<ApiUsageLog>,
    webhook_events: HashMap<Uuid, WebhookEventRecord>,
    entities: HashMap<String, Entity>,
    risk_flags: Vec<(String, RiskFlag, DateTime<Utc>)>,
    flow_paths: HashMap<Uuid, FlowPath>,
    transactions: HashMap<String, ParsedTransaction>,
    transfers: Vec<Transfer>,
}

/// In-memory `Store`. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: number of persisted flow paths.
    pub async fn flow_path_count(&self) -> usize {
        self.inner.read().await.flow_paths.len()
    }

    /// Test helper: persisted flow paths.
    pub async fn flow_paths(&self) -> Vec<FlowPath> {
        self.inner.read().await.flow_paths.values().cloned().collect()
    }

    /// Test helper: appended usage logs.
    pub async fn usage_logs(&self) -> Vec<ApiUsageLog> {
        self.inner.read().await.usage_logs.clone()
    }

    /// Test helper: webhook audit rows.
    pub async fn webhook_events(&self) -> Vec<WebhookEventRecord> {
        self.inner.read().await.webhook_events.values().cloned().collect()
    }

    /// Test helper: recorded risk flags for an address.
    pub async fn risk_flags_for(&self, address: &str) -> Vec<RiskFlag> {
        self.inner
            .read()
            .await
            .risk_flags
            .iter()
            .filter(|(a, _, _)| a == address)
            .map(|(_, f, _)| f.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_auth_context(&self, key_hash: &str) -> Result<Option<AuthContext>> {
        let inner = self.inner.read().await;
        let Some(key) = inner
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash && k.active)
        else {
            return Ok(None);
        };
        let Some(user) = inner.users.get(&key.user_id) else {
            return Ok(None);
        };
        let Some(subscription) = inner
            .subscriptions
            .values()
            .find(|s| s.user_id == key.user_id && s.status == AccountStatus::Active)
        else {
            return Ok(None);
        };
        Ok(Some(AuthContext {
            user: user.clone(),
            subscription: subscription.clone(),
            api_key: key.clone(),
        }))
    }

    async fn touch_api_key(&self, key_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(key) = inner.api_keys.get_mut(&key_id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn record_successful_call(&self, subscription_id: Uuid, key_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(sub) = inner.subscriptions.get_mut(&subscription_id) {
            sub.current_usage += 1;
        }
        if let Some(key) = inner.api_keys.get_mut(&key_id) {
            key.total_calls += 1;
        }
        Ok(())
    }

    async fn insert_usage_log(&self, log: ApiUsageLog) -> Result<()> {
        self.inner.write().await.usage_logs.push(log);
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.external_user_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }

    async fn create_tenant(
        &self,
        user: User,
        subscription: Subscription,
        key: ApiKeyRecord,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.users.values().any(|u| u.email == user.email) {
            bail!("duplicate email");
        }
        inner.users.insert(user.id, user);
        inner.subscriptions.insert(subscription.id, subscription);
        inner.api_keys.insert(key.id, key);
        Ok(())
    }

    async fn active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.status == AccountStatus::Active)
            .cloned())
    }

    async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKeyRecord>> {
        let inner = self.inner.read().await;
        let mut keys: Vec<_> = inner
            .api_keys
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn insert_api_key(&self, key: ApiKeyRecord) -> Result<()> {
        self.inner.write().await.api_keys.insert(key.id, key);
        Ok(())
    }

    async fn revoke_api_key(&self, user_id: Uuid, key_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.api_keys.get_mut(&key_id) {
            Some(key) if key.user_id == user_id => {
                if key.active {
                    key.active = false;
                    key.revoked_at = Some(at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn change_plan(&self, user_id: Uuid, plan: Plan, limits: PlanLimits) -> Result<()> {
        let mut inner = self.inner.write().await;
        for sub in inner.subscriptions.values_mut() {
            if sub.user_id == user_id && sub.status == AccountStatus::Active {
                sub.plan = plan;
                sub.monthly_quota = limits.monthly_quota;
                sub.rate_limit_per_minute = limits.rate_limit_per_minute;
                sub.price_cents = limits.price_cents;
            }
        }
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.plan = plan;
        }
        Ok(())
    }

    async fn cancel_subscription(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for sub in inner.subscriptions.values_mut() {
            if sub.user_id == user_id && sub.status == AccountStatus::Active {
                sub.status = AccountStatus::Cancelled;
                sub.cancelled_at = Some(at);
            }
        }
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.status = AccountStatus::Cancelled;
        }
        Ok(())
    }

    async fn renew_subscription(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        for sub in inner.subscriptions.values_mut() {
            if sub.user_id == user_id {
                sub.status = AccountStatus::Active;
                sub.current_usage = 0;
                sub.cancelled_at = None;
                sub.billing_period_start = period_start;
                sub.billing_period_end = period_end;
            }
        }
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.status = AccountStatus::Active;
        }
        Ok(())
    }

    async fn insert_webhook_event(&self, event: WebhookEventRecord) -> Result<()> {
        self.inner.write().await.webhook_events.insert(event.id, event);
        Ok(())
    }

    async fn mark_webhook_event(
        &self,
        event_id: Uuid,
        processed: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(event) = inner.webhook_events.get_mut(&event_id) {
            event.processed = processed;
            event.processed_at = processed.then_some(at);
            event.error_message = error;
        }
        Ok(())
    }

    async fn get_entity(&self, address: &str) -> Result<Option<Entity>> {
        Ok(self.inner.read().await.entities.get(address).cloned())
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        self.inner
            .write()
            .await
            .entities
            .insert(entity.address.clone(), entity);
        Ok(())
    }

    async fn entities_by_kind(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entities
            .values()
            .filter(|e| e.entity_kind == kind)
            .cloned()
            .collect())
    }

    async fn update_entity_risk(&self, address: &str, score: u8, level: RiskLevel) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .entry(address.to_string())
            .or_insert_with(|| Entity {
                address: address.to_string(),
                entity_kind: EntityKind::Wallet,
                name: None,
                risk_level: RiskLevel::Low,
                risk_score: 0,
                metadata: serde_json::json!({}),
            });
        entity.risk_score = score;
        entity.risk_level = level;
        Ok(())
    }

    async fn insert_risk_flags(
        &self,
        address: &str,
        flags: &[RiskFlag],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        for flag in flags {
            inner
                .risk_flags
                .push((address.to_string(), flag.clone(), at));
        }
        Ok(())
    }

    async fn upsert_flow_path(&self, path: &FlowPath) -> Result<()> {
        self.inner
            .write()
            .await
            .flow_paths
            .insert(path.path_id, path.clone());
        Ok(())
    }

    async fn ingest_transaction(
        &self,
        tx: &ParsedTransaction,
        transfers: &[Transfer],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.transactions.insert(tx.signature.clone(), tx.clone());
        inner.transfers.extend_from_slice(transfers);
        Ok(())
    }
}
