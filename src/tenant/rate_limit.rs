//! Per-key request rate limiting.
//!
//! Primary path: a minute-bucketed counter in the KV store, shared by
//! every process. When the KV store is unavailable the limiter falls back
//! to an in-process sliding window; fallback state is LRU-bounded
//! (capacity 1000, entries expire after an hour) so an abusive key churn
//! cannot grow server memory.

use chrono::Utc;
use moka::sync::Cache;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::cache::KvCache;

/// Fallback table capacity.
const FALLBACK_CAPACITY: u64 = 1000;
/// Fallback entry lifetime.
const FALLBACK_TTL: Duration = Duration::from_secs(3600);
/// Window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a rate check, carrying everything the response headers need.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds when the window resets
    pub reset_at: i64,
    /// Seconds the caller should wait when rejected
    pub retry_after_secs: u64,
}

type WindowLog = Arc<Mutex<VecDeque<Instant>>>;

/// Sliding-minute limiter keyed by API key id.
pub struct KeyRateLimiter {
    kv: KvCache,
    fallback: Cache<Uuid, WindowLog>,
}

impl KeyRateLimiter {
    pub fn new(kv: KvCache) -> Self {
        Self {
            kv,
            fallback: Cache::builder()
                .max_capacity(FALLBACK_CAPACITY)
                .time_to_live(FALLBACK_TTL)
                .build(),
        }
    }

    /// Check and count one request for `key_id` under `limit` per minute.
    pub async fn check(&self, key_id: Uuid, limit: u32) -> RateDecision {
        let now = Utc::now().timestamp();
        let minute = now.div_euclid(60);
        let reset_at = (minute + 1) * 60;

        let kv_key = format!("rate:{}:{}", key_id, minute);
        // Bucket TTL outlives the window so a slow reader still sees it.
        if let Some(count) = self.kv.incr_with_expiry(&kv_key, WINDOW * 2).await {
            let count = count.max(0) as u32;
            if count > limit {
                return RateDecision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at,
                    retry_after_secs: (reset_at - now).max(1) as u64,
                };
            }
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit - count,
                reset_at,
                retry_after_secs: 0,
            };
        }

        debug!(key_id = %key_id, "KV store unavailable, using in-process rate window");
        self.check_fallback(key_id, limit, reset_at, now)
    }

    fn check_fallback(&self, key_id: Uuid, limit: u32, reset_at: i64, now: i64) -> RateDecision {
        let log = self
            .fallback
            .get_with(key_id, || Arc::new(Mutex::new(VecDeque::new())));
        let mut window = log.lock().expect("rate window lock poisoned");

        let horizon = Instant::now() - WINDOW;
        while window.front().is_some_and(|t| *t < horizon) {
            window.pop_front();
        }

        if window.len() >= limit as usize {
            let retry_after = window
                .front()
                .map(|oldest| WINDOW.saturating_sub(oldest.elapsed()).as_secs().max(1))
                .unwrap_or(1);
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after_secs: retry_after,
            };
        }

        window.push_back(Instant::now());
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - window.len() as u32,
            reset_at: now + WINDOW.as_secs() as i64,
            retry_after_secs: 0,
        }
    }
}
