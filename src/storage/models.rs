//! Persisted row types shared by the tenant gate and the engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Plan;

/// Semantic role of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Dex,
    Bridge,
    Lending,
    Mixer,
    Sanctioned,
    Wallet,
    Pool,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Dex => "dex",
            EntityKind::Bridge => "bridge",
            EntityKind::Lending => "lending",
            EntityKind::Mixer => "mixer",
            EntityKind::Sanctioned => "sanctioned",
            EntityKind::Wallet => "wallet",
            EntityKind::Pool => "pool",
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "dex" => Some(EntityKind::Dex),
            "bridge" => Some(EntityKind::Bridge),
            "lending" => Some(EntityKind::Lending),
            "mixer" => Some(EntityKind::Mixer),
            "sanctioned" => Some(EntityKind::Sanctioned),
            "wallet" => Some(EntityKind::Wallet),
            "pool" => Some(EntityKind::Pool),
            _ => None,
        }
    }
}

/// Risk band derived from a 0-100 score: <25 low, <50 medium, <75 high,
/// else critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> RiskLevel {
        match score {
            0..=24 => RiskLevel::Low,
            25..=49 => RiskLevel::Medium,
            50..=74 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// A known or observed on-chain entity. Mutated only by the registry and
/// the risk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub address: String,
    pub entity_kind: EntityKind,
    pub name: Option<String>,
    pub risk_level: RiskLevel,
    pub risk_score: u8,
    pub metadata: serde_json::Value,
}

/// Flag severity attached to a risk assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagSeverity {
    Warning,
    Critical,
}

/// One positive risk check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFlag {
    pub flag_type: String,
    pub severity: FlagSeverity,
    pub description: String,
    pub details: serde_json::Value,
}

/// Account status of a tenant user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Cancelled,
    Expired,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Cancelled => "cancelled",
            AccountStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<AccountStatus> {
        match s {
            "active" => Some(AccountStatus::Active),
            "cancelled" => Some(AccountStatus::Cancelled),
            "expired" => Some(AccountStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Canonical lowercase
    pub email: String,
    pub full_name: Option<String>,
    pub company_name: Option<String>,
    pub plan: Plan,
    pub status: AccountStatus,
    /// Opaque marketplace id; unique when present
    pub external_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// At most one active subscription exists per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: Plan,
    pub monthly_quota: i64,
    pub rate_limit_per_minute: u32,
    pub current_usage: i64,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub status: AccountStatus,
    pub price_cents: i64,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Hashed API key row. The raw key is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// hex(HMAC-SHA256(server salt, raw key))
    pub key_hash: String,
    /// First 16 chars of the raw key, for display
    pub key_prefix: String,
    pub name: Option<String>,
    pub active: bool,
    pub total_calls: i64,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Append-only webhook audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One authorized API call, appended asynchronously after the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsageLog {
    pub user_id: Uuid,
    pub api_key_id: Uuid,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Joined authentication context for one key lookup.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub subscription: Subscription,
    pub api_key: ApiKeyRecord,
}
