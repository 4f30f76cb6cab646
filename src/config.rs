//! Service configuration and the startup environment contract.
//!
//! Every deployment-critical variable is validated once at startup; a
//! broken contract refuses to start the process rather than degrading
//! silently at request time. The only optional piece is the KV host,
//! which downgrades the cache to a no-op.

use anyhow::{anyhow, bail, Result};
use std::env;

use crate::security::validate_secret;

/// Placeholder salts shipped in sample env files. Startup refuses them.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "change-me-in-production",
    "your-secret-here",
    "placeholder",
];

/// Minimum length for salts, admin keys and webhook secrets.
pub const MIN_SECRET_LEN: usize = 32;

/// Subscription plan identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Plan> {
        match s.to_ascii_lowercase().as_str() {
            "starter" => Some(Plan::Starter),
            "pro" => Some(Plan::Pro),
            "enterprise" => Some(Plan::Enterprise),
            _ => None,
        }
    }
}

/// Quota, rate and price for one subscription plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    /// Requests allowed per billing month
    pub monthly_quota: i64,
    /// Requests allowed per minute per API key
    pub rate_limit_per_minute: u32,
    /// Monthly price in cents
    pub price_cents: i64,
}

/// Authoritative plan catalog.
pub fn plan_limits(plan: Plan) -> PlanLimits {
    match plan {
        Plan::Starter => PlanLimits {
            monthly_quota: 1_000,
            rate_limit_per_minute: 10,
            price_cents: 1_000,
        },
        Plan::Pro => PlanLimits {
            monthly_quota: 10_000,
            rate_limit_per_minute: 60,
            price_cents: 5_000,
        },
        Plan::Enterprise => PlanLimits {
            monthly_quota: 100_000,
            rate_limit_per_minute: 600,
            price_cents: 20_000,
        },
    }
}

/// Runtime configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enhanced-RPC provider API key
    pub upstream_api_key: String,
    /// Base URL for JSON-RPC calls
    pub upstream_rpc_url: String,
    /// Base URL for the enhanced-transactions API
    pub upstream_api_url: String,
    /// Postgres connection string
    pub database_url: String,
    /// Redis connection string; None downgrades the cache to no-op
    pub redis_url: Option<String>,
    /// Server salt for API-key hashing (HMAC-SHA256 key)
    pub api_key_salt: String,
    /// Admin key for the external training surface; validated, held only
    pub admin_api_key: String,
    /// Shared secret for marketplace webhook signatures
    pub webhook_secret: String,
    /// Base URL of the intent-inference service
    pub intent_service_url: String,
    /// Comma-separated CORS origin allow-list (required in production)
    pub allowed_origins: Vec<String>,
    /// true when ENVIRONMENT=production
    pub production: bool,
    /// HTTP listen port
    pub port: u16,
}

impl Config {
    /// Resolve and validate the full environment contract.
    ///
    /// # Errors
    /// Any missing required variable, an undersized or placeholder secret,
    /// or a production deployment without an origin allow-list.
    pub fn from_env() -> Result<Self> {
        let upstream_api_key = require("HELIUS_API_KEY")?;
        let database_url = require("DATABASE_URL")?;

        let api_key_salt = require("API_KEY_SALT")?;
        validate_secret("API_KEY_SALT", &api_key_salt, MIN_SECRET_LEN, PLACEHOLDER_SECRETS)?;
        let admin_api_key = require("ADMIN_API_KEY")?;
        validate_secret("ADMIN_API_KEY", &admin_api_key, MIN_SECRET_LEN, PLACEHOLDER_SECRETS)?;
        let webhook_secret = require("APIX_WEBHOOK_SECRET")?;
        validate_secret(
            "APIX_WEBHOOK_SECRET",
            &webhook_secret,
            MIN_SECRET_LEN,
            PLACEHOLDER_SECRETS,
        )?;

        let production = env::var("ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if production && allowed_origins.is_empty() {
            bail!("ALLOWED_ORIGINS must be set in production");
        }

        let port = env::var("PORT")
            .ok()
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| anyhow!("PORT is not a valid port number: {}", e))?
            .unwrap_or(3000);

        let upstream_rpc_url = env::var("HELIUS_RPC_URL")
            .unwrap_or_else(|_| "https://mainnet.helius-rpc.com".to_string());
        let upstream_api_url = env::var("HELIUS_API_URL")
            .unwrap_or_else(|_| "https://api.helius.xyz".to_string());
        let intent_service_url = env::var("INTENT_SERVICE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());

        Ok(Self {
            upstream_api_key,
            upstream_rpc_url,
            upstream_api_url,
            database_url,
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            api_key_salt,
            admin_api_key,
            webhook_secret,
            intent_service_url,
            allowed_origins,
            production,
            port,
        })
    }
}

fn require(name: &str) -> Result<String> {
    env::var(name)
        .map_err(|_| anyhow!("{} must be set", name))
        .and_then(|v| {
            if v.trim().is_empty() {
                Err(anyhow!("{} must not be empty", name))
            } else {
                Ok(v)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_catalog_quotas() {
        assert_eq!(plan_limits(Plan::Starter).monthly_quota, 1_000);
        assert_eq!(plan_limits(Plan::Pro).monthly_quota, 10_000);
        assert_eq!(plan_limits(Plan::Enterprise).monthly_quota, 100_000);
        assert_eq!(plan_limits(Plan::Enterprise).rate_limit_per_minute, 600);
    }

    #[test]
    fn plan_parse_is_case_insensitive() {
        assert_eq!(Plan::parse("PRO"), Some(Plan::Pro));
        assert_eq!(Plan::parse("starter"), Some(Plan::Starter));
        assert_eq!(Plan::parse("gold"), None);
    }
}
