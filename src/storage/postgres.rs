//! Relational `Store` implementation over Postgres.
//!
//! Plain parameterized queries; the tenant-creation and
//! transaction-ingestion paths run in explicit transactions with rollback
//! on error. Exact token amounts travel as their decimal-string form.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::models::{
    AccountStatus, ApiKeyRecord, ApiUsageLog, AuthContext, Entity, EntityKind, RiskFlag,
    RiskLevel, Subscription, User, WebhookEventRecord,
};
use super::Store;
use crate::config::{Plan, PlanLimits};
use crate::graph::types::FlowPath;
use crate::upstream::types::{ParsedTransaction, Transfer};

/// Postgres-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a bounded pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        full_name: row.try_get("full_name")?,
        company_name: row.try_get("company_name")?,
        plan: Plan::parse(row.try_get::<String, _>("plan")?.as_str())
            .context("unknown plan in users row")?,
        status: AccountStatus::parse(row.try_get::<String, _>("status")?.as_str())
            .context("unknown status in users row")?,
        external_user_id: row.try_get("external_user_id")?,
        created_at: row.try_get("created_at")?,
        last_login_at: row.try_get("last_login_at")?,
    })
}

fn row_to_subscription(row: &PgRow) -> Result<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        plan: Plan::parse(row.try_get::<String, _>("plan")?.as_str())
            .context("unknown plan in subscriptions row")?,
        monthly_quota: row.try_get("monthly_quota")?,
        rate_limit_per_minute: row.try_get::<i32, _>("rate_limit_per_minute")? as u32,
        current_usage: row.try_get("current_usage")?,
        billing_period_start: row.try_get("billing_period_start")?,
        billing_period_end: row.try_get("billing_period_end")?,
        status: AccountStatus::parse(row.try_get::<String, _>("status")?.as_str())
            .context("unknown status in subscriptions row")?,
        price_cents: row.try_get("price_cents")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

fn row_to_api_key(row: &PgRow) -> Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        name: row.try_get("name")?,
        active: row.try_get("active")?,
        total_calls: row.try_get("total_calls")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
        expires_at: row.try_get("expires_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

fn row_to_entity(row: &PgRow) -> Result<Entity> {
    Ok(Entity {
        address: row.try_get("address")?,
        entity_kind: EntityKind::parse(row.try_get::<String, _>("entity_type")?.as_str())
            .context("unknown entity_type in entities row")?,
        name: row.try_get("name")?,
        risk_level: RiskLevel::from_score(row.try_get::<i16, _>("risk_score")?.clamp(0, 100) as u8),
        risk_score: row.try_get::<i16, _>("risk_score")?.clamp(0, 100) as u8,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn find_auth_context(&self, key_hash: &str) -> Result<Option<AuthContext>> {
        let Some(key_row) = sqlx::query(
            "SELECT * FROM api_keys WHERE key_hash = $1 AND active = TRUE",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let api_key = row_to_api_key(&key_row)?;

        let Some(user_row) = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(api_key.user_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let Some(sub_row) = sqlx::query(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND status = 'active'",
        )
        .bind(api_key.user_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        Ok(Some(AuthContext {
            user: row_to_user(&user_row)?,
            subscription: row_to_subscription(&sub_row)?,
            api_key,
        }))
    }

    async fn touch_api_key(&self, key_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(key_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_successful_call(&self, subscription_id: Uuid, key_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET current_usage = current_usage + 1 WHERE id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE api_keys SET total_calls = total_calls + 1 WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_usage_log(&self, log: ApiUsageLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_usage_logs \
             (user_id, api_key_id, endpoint, method, status_code, response_time_ms, \
              user_agent, ip_address, request_id, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(log.user_id)
        .bind(log.api_key_id)
        .bind(&log.endpoint)
        .bind(&log.method)
        .bind(log.status_code as i32)
        .bind(log.response_time_ms as i64)
        .bind(&log.user_agent)
        .bind(&log.ip_address)
        .bind(&log.request_id)
        .bind(log.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE external_user_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn create_tenant(
        &self,
        user: User,
        subscription: Subscription,
        key: ApiKeyRecord,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO users \
             (id, email, full_name, company_name, plan, status, external_user_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.company_name)
        .bind(user.plan.as_str())
        .bind(user.status.as_str())
        .bind(&user.external_user_id)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO subscriptions \
             (id, user_id, plan, monthly_quota, rate_limit_per_minute, current_usage, \
              billing_period_start, billing_period_end, status, price_cents) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(subscription.plan.as_str())
        .bind(subscription.monthly_quota)
        .bind(subscription.rate_limit_per_minute as i32)
        .bind(subscription.current_usage)
        .bind(subscription.billing_period_start)
        .bind(subscription.billing_period_end)
        .bind(subscription.status.as_str())
        .bind(subscription.price_cents)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO api_keys \
             (id, user_id, key_hash, key_prefix, name, active, total_calls, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(key.id)
        .bind(key.user_id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.name)
        .bind(key.active)
        .bind(key.total_calls)
        .bind(key.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKeyRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM api_keys WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_api_key).collect()
    }

    async fn insert_api_key(&self, key: ApiKeyRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_keys \
             (id, user_id, key_hash, key_prefix, name, active, total_calls, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(key.id)
        .bind(key.user_id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.name)
        .bind(key.active)
        .bind(key.total_calls)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_api_key(&self, user_id: Uuid, key_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        // Already-revoked keys still match: revocation is an idempotent
        // no-op for the owning user.
        let result = sqlx::query(
            "UPDATE api_keys SET \
               active = FALSE, \
               revoked_at = COALESCE(revoked_at, $3) \
             WHERE id = $1 AND user_id = $2",
        )
        .bind(key_id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn change_plan(&self, user_id: Uuid, plan: Plan, limits: PlanLimits) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE subscriptions SET plan = $2, monthly_quota = $3, \
             rate_limit_per_minute = $4, price_cents = $5 \
             WHERE user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .bind(plan.as_str())
        .bind(limits.monthly_quota)
        .bind(limits.rate_limit_per_minute as i32)
        .bind(limits.price_cents)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE users SET plan = $2 WHERE id = $1")
            .bind(user_id)
            .bind(plan.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_subscription(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE subscriptions SET status = 'cancelled', cancelled_at = $2 \
             WHERE user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE users SET status = 'cancelled' WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn renew_subscription(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE subscriptions SET status = 'active', current_usage = 0, \
             cancelled_at = NULL, billing_period_start = $2, billing_period_end = $3 \
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(period_start)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE users SET status = 'active' WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_webhook_event(&self, event: WebhookEventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_events \
             (id, source, event_type, payload, received_at, processed) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id)
        .bind(&event.source)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.received_at)
        .bind(event.processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_webhook_event(
        &self,
        event_id: Uuid,
        processed: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events SET processed = $2, processed_at = $3, error_message = $4 \
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(processed)
        .bind(processed.then_some(at))
        .bind(&error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_entity(&self, address: &str) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        sqlx::query(
            "INSERT INTO entities (address, entity_type, name, risk_score, metadata) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (address) DO UPDATE SET \
               entity_type = EXCLUDED.entity_type, \
               name = COALESCE(EXCLUDED.name, entities.name), \
               risk_score = EXCLUDED.risk_score, \
               metadata = EXCLUDED.metadata",
        )
        .bind(&entity.address)
        .bind(entity.entity_kind.as_str())
        .bind(&entity.name)
        .bind(entity.risk_score as i16)
        .bind(&entity.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entities_by_kind(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let rows = sqlx::query("SELECT * FROM entities WHERE entity_type = $1")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entity).collect()
    }

    async fn update_entity_risk(&self, address: &str, score: u8, level: RiskLevel) -> Result<()> {
        sqlx::query(
            "INSERT INTO entities (address, entity_type, risk_score, metadata) \
             VALUES ($1, 'wallet', $2, '{}'::jsonb) \
             ON CONFLICT (address) DO UPDATE SET risk_score = $2",
        )
        .bind(address)
        .bind(score as i16)
        .execute(&self.pool)
        .await?;
        let _ = level; // level derives from the score on read
        Ok(())
    }

    async fn insert_risk_flags(
        &self,
        address: &str,
        flags: &[RiskFlag],
        at: DateTime<Utc>,
    ) -> Result<()> {
        for flag in flags {
            sqlx::query(
                "INSERT INTO risk_flags (address, flag_type, severity, description, details, flagged_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(address)
            .bind(&flag.flag_type)
            .bind(match flag.severity {
                super::models::FlagSeverity::Warning => "warning",
                super::models::FlagSeverity::Critical => "critical",
            })
            .bind(&flag.description)
            .bind(&flag.details)
            .bind(at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn upsert_flow_path(&self, path: &FlowPath) -> Result<()> {
        sqlx::query(
            "INSERT INTO flow_paths \
             (path_id, start_address, end_address, token_mint, hops, total_amount, \
              hop_count, confidence_score, intent, intent_confidence, risk_score) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (path_id) DO UPDATE SET \
               hops = EXCLUDED.hops, \
               total_amount = EXCLUDED.total_amount, \
               hop_count = EXCLUDED.hop_count, \
               confidence_score = EXCLUDED.confidence_score, \
               intent = EXCLUDED.intent, \
               intent_confidence = EXCLUDED.intent_confidence, \
               risk_score = EXCLUDED.risk_score",
        )
        .bind(path.path_id)
        .bind(&path.start_address)
        .bind(&path.end_address)
        .bind(&path.token_mint)
        .bind(serde_json::to_value(&path.hops)?)
        .bind(path.total_amount.to_string())
        .bind(path.hop_count as i32)
        .bind(path.confidence_score)
        .bind(&path.intent)
        .bind(path.intent_confidence)
        .bind(path.risk_score.map(|s| s as i16))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ingest_transaction(
        &self,
        tx: &ParsedTransaction,
        transfers: &[Transfer],
    ) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO transactions (signature, block_time, slot, fee, success) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (signature) DO NOTHING",
        )
        .bind(&tx.signature)
        .bind(tx.block_time)
        .bind(tx.slot as i64)
        .bind(tx.fee as i64)
        .bind(tx.success)
        .execute(&mut *db_tx)
        .await?;

        for transfer in transfers {
            sqlx::query(
                "INSERT INTO transfers \
                 (signature, from_address, to_address, token_mint, amount, decimals, \
                  instruction_index, block_time, tx_type) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&transfer.signature)
            .bind(&transfer.from_address)
            .bind(&transfer.to_address)
            .bind(&transfer.token_mint)
            .bind(transfer.amount.to_string())
            .bind(transfer.decimals as i16)
            .bind(transfer.instruction_index as i32)
            .bind(transfer.block_time)
            .bind(match transfer.tx_type {
                crate::upstream::types::TxType::Transfer => "transfer",
                crate::upstream::types::TxType::Swap => "swap",
                crate::upstream::types::TxType::Unknown => "unknown",
            })
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        Ok(())
    }
}
