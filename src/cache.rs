//! TTL-scoped key-value cache with JSON helpers.
//!
//! Backed by redis when a KV host is configured; otherwise the cache runs
//! in a degraded no-op mode so the service keeps answering (slower) from
//! the upstream. Reads and writes are last-writer-wins. A cache failure is
//! never fatal to a request: errors downgrade to a miss with a warning.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Sentinel stored for negative results (e.g. a signature the upstream
/// does not know). Kept distinct from any real JSON payload.
const NEGATIVE_SENTINEL: &str = "\u{0}nil";

/// Upper bound on how long a negative result may be remembered.
pub const NEGATIVE_TTL_CAP: Duration = Duration::from_secs(60);

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    Disabled,
}

/// Outcome of a cache read distinguishing a remembered miss from an
/// unknown key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheHit<T> {
    /// Value was cached
    Value(T),
    /// A negative result was cached: the underlying lookup is known empty
    Negative,
    /// Nothing cached
    Miss,
}

/// Process-wide KV cache handle. Cheap to clone.
#[derive(Clone)]
pub struct KvCache {
    backend: Backend,
}

impl KvCache {
    /// Connect to redis, or fall back to the no-op mode when `redis_url`
    /// is absent or the connection cannot be established.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let Some(url) = redis_url else {
            info!("no KV host configured, cache running in no-op mode");
            return Self { backend: Backend::Disabled };
        };

        match redis::Client::open(url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(connection) => {
                    info!("connected to KV store");
                    Self { backend: Backend::Redis(connection) }
                }
                Err(e) => {
                    warn!(error = %e, "KV store unreachable, cache running in no-op mode");
                    Self { backend: Backend::Disabled }
                }
            },
            Err(e) => {
                warn!(error = %e, "invalid KV url, cache running in no-op mode");
                Self { backend: Backend::Disabled }
            }
        }
    }

    /// Construct a disabled cache. Used by tests and storage-less setups.
    pub fn disabled() -> Self {
        Self { backend: Backend::Disabled }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.backend, Backend::Redis(_))
    }

    /// Fetch and deserialize a cached JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheHit<T> {
        let Backend::Redis(conn) = &self.backend else {
            return CacheHit::Miss;
        };
        let mut conn = conn.clone();
        let raw: Option<String> = match conn.get(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, treating as miss");
                return CacheHit::Miss;
            }
        };
        match raw {
            None => CacheHit::Miss,
            Some(s) if s == NEGATIVE_SENTINEL => CacheHit::Negative,
            Some(s) => match serde_json::from_str(&s) {
                Ok(v) => CacheHit::Value(v),
                Err(e) => {
                    warn!(key = %key, error = %e, "cache payload unreadable, treating as miss");
                    CacheHit::Miss
                }
            },
        }
    }

    /// Serialize and store a value with a TTL.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Backend::Redis(conn) = &self.backend else {
            return;
        };
        let json = match serde_json::to_string(value) {
            Ok(j) => j,
            Err(e) => {
                warn!(key = %key, error = %e, "cache serialize failed");
                return;
            }
        };
        let mut conn = conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(key, json, ttl.as_secs().max(1))
            .await
        {
            warn!(key = %key, error = %e, "cache write failed");
        }
    }

    /// Remember that a lookup returned nothing. The TTL is capped so a
    /// late-confirming transaction is not shadowed for long.
    pub async fn set_negative(&self, key: &str, ttl: Duration) {
        let Backend::Redis(conn) = &self.backend else {
            return;
        };
        let ttl = ttl.min(NEGATIVE_TTL_CAP);
        let mut conn = conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(key, NEGATIVE_SENTINEL, ttl.as_secs().max(1))
            .await
        {
            warn!(key = %key, error = %e, "negative cache write failed");
        }
    }

    pub async fn delete(&self, key: &str) {
        let Backend::Redis(conn) = &self.backend else {
            return;
        };
        let mut conn = conn.clone();
        if let Err(e) = conn.del::<_, ()>(key).await {
            warn!(key = %key, error = %e, "cache delete failed");
        }
    }

    /// Atomically increment a counter key, setting its expiry on first
    /// increment. Returns the post-increment value, or None when the KV
    /// store is unavailable (callers fall back to in-process limiting).
    pub async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Option<i64> {
        let Backend::Redis(conn) = &self.backend else {
            return None;
        };
        let mut conn = conn.clone();
        let count: i64 = match conn.incr(key, 1).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "rate counter increment failed");
                return None;
            }
        };
        if count == 1 {
            if let Err(e) = conn.expire::<_, ()>(key, ttl.as_secs() as i64).await {
                warn!(key = %key, error = %e, "rate counter expire failed");
            }
        }
        Some(count)
    }
}
