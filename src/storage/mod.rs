//! Persistence contracts and their implementations.
//!
//! The engines and the tenant gate talk to [`Store`], never to a concrete
//! database: [`PgStore`] is the production relational implementation and
//! [`MemoryStore`] is a deterministic in-process implementation used by
//! the test suites.

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{Plan, PlanLimits};
use crate::graph::types::FlowPath;
use crate::upstream::types::{ParsedTransaction, Transfer};
use models::{
    ApiKeyRecord, ApiUsageLog, AuthContext, Entity, EntityKind, RiskFlag, RiskLevel, Subscription,
    User, WebhookEventRecord,
};

/// Relational DAO contract used by the tenant gate and the engines.
#[async_trait]
pub trait Store: Send + Sync {
    // -- tenant gate --------------------------------------------------------

    /// Single parameterized lookup joining an active key with its user and
    /// active subscription.
    async fn find_auth_context(&self, key_hash: &str) -> Result<Option<AuthContext>>;

    /// Record key usage time. Fired detached from the request deadline.
    async fn touch_api_key(&self, key_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Increment `current_usage` and the key's `total_calls` after an
    /// authorized request.
    async fn record_successful_call(&self, subscription_id: Uuid, key_id: Uuid) -> Result<()>;

    async fn insert_usage_log(&self, log: ApiUsageLog) -> Result<()>;

    // -- users, subscriptions, keys -----------------------------------------

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>>;
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>>;

    /// Create user + subscription + first API key in one transaction.
    async fn create_tenant(
        &self,
        user: User,
        subscription: Subscription,
        key: ApiKeyRecord,
    ) -> Result<()>;

    async fn active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>>;
    async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKeyRecord>>;
    async fn insert_api_key(&self, key: ApiKeyRecord) -> Result<()>;

    /// Soft-delete a key owned by `user_id`. Returns false when the key
    /// does not exist or belongs to someone else; revoking an
    /// already-revoked key is a successful no-op.
    async fn revoke_api_key(&self, user_id: Uuid, key_id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Update subscription plan/quota/rate and mirror the plan onto the
    /// user row.
    async fn change_plan(&self, user_id: Uuid, plan: Plan, limits: PlanLimits) -> Result<()>;

    /// Mark the subscription cancelled and mirror onto the user status.
    async fn cancel_subscription(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Reactivate, reset `current_usage` to zero and advance the billing
    /// window.
    async fn renew_subscription(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()>;

    // -- webhook audit ------------------------------------------------------

    async fn insert_webhook_event(&self, event: WebhookEventRecord) -> Result<()>;
    async fn mark_webhook_event(
        &self,
        event_id: Uuid,
        processed: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    // -- entities and analytics ---------------------------------------------

    async fn get_entity(&self, address: &str) -> Result<Option<Entity>>;
    async fn upsert_entity(&self, entity: Entity) -> Result<()>;
    async fn entities_by_kind(&self, kind: EntityKind) -> Result<Vec<Entity>>;

    /// Cache a risk outcome on the entity row, creating a wallet entity
    /// when none exists yet.
    async fn update_entity_risk(&self, address: &str, score: u8, level: RiskLevel) -> Result<()>;

    async fn insert_risk_flags(
        &self,
        address: &str,
        flags: &[RiskFlag],
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn upsert_flow_path(&self, path: &FlowPath) -> Result<()>;

    /// Persist a transaction with its transfers in one transaction.
    async fn ingest_transaction(
        &self,
        tx: &ParsedTransaction,
        transfers: &[Transfer],
    ) -> Result<()>;
}
