//! Types for token-flow path reconstruction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::models::{EntityKind, RiskLevel};
use crate::upstream::types::amount_string;

/// Traversal direction relative to the queried address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Hard ceiling on traversal depth; requested depths clamp to this.
pub const MAX_DEPTH_CEILING: usize = 10;
/// Traversal stops expanding once this many nodes have been visited.
pub const MAX_VISITED: usize = 10_000;
/// Traversal stops once this many paths have been collected.
pub const MAX_PATHS: usize = 1_000;

/// One hop of a reconstructed path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathNode {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_kind: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    /// Aggregated inflow into this hop, exact
    #[serde(with = "amount_string")]
    pub amount_in: u128,
    /// Aggregated outflow toward the next hop, exact
    #[serde(with = "amount_string")]
    pub amount_out: u128,
    /// Earliest block time of the aggregated transfers, unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PathNode {
    /// Amount that moved through this hop: the origin counts its outflow,
    /// every later hop its inflow.
    pub fn throughput(&self) -> u128 {
        if self.amount_in > 0 {
            self.amount_in
        } else {
            self.amount_out
        }
    }
}

/// A reconstructed multi-hop flow. `hop_count` always equals `hops.len()`
/// and is at least 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPath {
    pub path_id: Uuid,
    pub start_address: String,
    pub end_address: String,
    pub token_mint: String,
    pub hops: Vec<PathNode>,
    #[serde(with = "amount_string")]
    pub total_amount: u128,
    pub hop_count: usize,
    /// Plausibility of the reconstruction, in [0, 1]
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

/// A cycle in the transfer graph returning to its origin.
/// `addresses.first() == addresses.last()` and the cycle involves more
/// than two positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircularFlow {
    pub addresses: Vec<String>,
    #[serde(with = "amount_string")]
    pub total_amount: u128,
    pub cycle_count: u32,
}

/// Inclusive time window applied to traversals, in seconds back from now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub seconds: i64,
}

impl TimeWindow {
    pub fn days(days: i64) -> Self {
        Self { seconds: days * 86_400 }
    }

    /// Earliest acceptable block time relative to `now` (unix seconds).
    pub fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_prefers_inflow() {
        let node = PathNode {
            address: "a".into(),
            entity_kind: None,
            entity_name: None,
            amount_in: 500,
            amount_out: 400,
            timestamp: None,
        };
        assert_eq!(node.throughput(), 500);

        let origin = PathNode {
            amount_in: 0,
            amount_out: 400,
            ..node
        };
        assert_eq!(origin.throughput(), 400);
    }

    #[test]
    fn time_window_cutoff() {
        let window = TimeWindow::days(30);
        assert_eq!(window.cutoff(3_000_000), 3_000_000 - 30 * 86_400);
    }
}
