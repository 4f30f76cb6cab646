//! Circuit breaker guarding the enhanced-RPC provider.
//!
//! Five consecutive failures open the circuit for sixty seconds. After the
//! cooldown the breaker goes half-open and admits probe calls; two
//! consecutive successes close it again, any failure re-opens it.

use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;

/// Consecutive failures required to open the circuit.
const FAILURE_THRESHOLD: u32 = 5;
/// How long the circuit stays open before probing.
const OPEN_DURATION: Duration = Duration::from_secs(60);
/// Consecutive half-open successes required to close.
const HALF_OPEN_SUCCESSES: u32 = 2;

/// State of the guarded endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests are refused until the cooldown elapses
    Open,
    /// Probe requests are admitted while recovery is confirmed
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Snapshot of breaker health for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerStats {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
}

/// Shared circuit breaker. Safe for concurrent use.
pub struct CircuitBreaker {
    inner: RwLock<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate a call. Returns `UpstreamUnavailable` while the circuit is
    /// open; transitions open -> half-open once the cooldown has elapsed.
    pub async fn check(&self) -> Result<(), UpstreamError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(OPEN_DURATION);
                if elapsed >= OPEN_DURATION {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    warn!("circuit breaker HALF-OPEN - admitting probe requests");
                    Ok(())
                } else {
                    Err(UpstreamError::Unavailable)
                }
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= HALF_OPEN_SUCCESSES {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    info!("circuit breaker CLOSED - upstream recovered");
                } else {
                    debug!(
                        successes = inner.half_open_successes,
                        required = HALF_OPEN_SUCCESSES,
                        "half-open probe succeeded"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= FAILURE_THRESHOLD {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker OPENED - upstream unavailable"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                warn!("half-open probe failed, circuit breaker re-OPENED");
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> BreakerStats {
        let inner = self.inner.read().await;
        BreakerStats {
            state: inner.state.as_str(),
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
        }
    }

    #[cfg(test)]
    async fn force_cooldown_elapsed(&self) {
        let mut inner = self.inner.write().await;
        inner.opened_at = Some(Instant::now() - OPEN_DURATION);
    }
}
