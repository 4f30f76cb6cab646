//! Path confidence scoring.
//!
//! Multiplicative score starting from 1.0, applied per consecutive hop
//! pair: amount continuity dominates, an intermediate DEX hop and a long
//! time gap each shave a little off. Clamped to [0, 1].

use super::types::PathNode;
use crate::storage::models::EntityKind;

/// Hop time gap beyond which continuity is doubted (24 h).
const TIME_GAP_SECS: i64 = 24 * 3600;

/// Score a hop sequence. Single-hop paths score 1.0.
pub fn score_path(hops: &[PathNode]) -> f64 {
    let mut confidence = 1.0_f64;

    for pair in hops.windows(2) {
        let prev = &pair[0];
        let curr = &pair[1];

        confidence *= ratio_factor(prev.amount_out, curr.amount_in);

        // An intermediate DEX can split or merge flows invisibly.
        if curr.entity_kind == Some(EntityKind::Dex) {
            confidence *= 0.98;
        }

        if let (Some(prev_ts), Some(curr_ts)) = (prev.timestamp, curr.timestamp) {
            if (curr_ts - prev_ts).abs() > TIME_GAP_SECS {
                confidence *= 0.9;
            }
        }
    }

    confidence.clamp(0.0, 1.0)
}

/// Continuity factor for the amount ratio `prev_out / curr_in`.
fn ratio_factor(prev_out: u128, curr_in: u128) -> f64 {
    if prev_out == 0 || curr_in == 0 {
        return 0.70;
    }
    let ratio = prev_out as f64 / curr_in as f64;
    if (0.95..=1.05).contains(&ratio) {
        1.0
    } else if (0.90..=1.10).contains(&ratio) {
        0.95
    } else if (0.80..=1.20).contains(&ratio) {
        0.85
    } else {
        0.70
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(amount_in: u128, amount_out: u128, ts: i64) -> PathNode {
        PathNode {
            address: "x".into(),
            entity_kind: None,
            entity_name: None,
            amount_in,
            amount_out,
            timestamp: Some(ts),
        }
    }

    #[test]
    fn exact_continuity_scores_one() {
        let hops = vec![
            node(0, 1_000_000, 100),
            node(1_000_000, 1_000_000, 200),
            node(1_000_000, 0, 300),
        ];
        assert!((score_path(&hops) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ratio_bands() {
        assert_eq!(ratio_factor(100, 100), 1.0);
        assert_eq!(ratio_factor(104, 100), 1.0);
        assert_eq!(ratio_factor(108, 100), 0.95);
        assert_eq!(ratio_factor(115, 100), 0.85);
        assert_eq!(ratio_factor(150, 100), 0.70);
        assert_eq!(ratio_factor(0, 100), 0.70);
    }

    #[test]
    fn dex_hop_discounts() {
        let mut hops = vec![node(0, 1_000, 100), node(1_000, 1_000, 200)];
        hops[1].entity_kind = Some(EntityKind::Dex);
        assert!((score_path(&hops) - 0.98).abs() < 1e-9);
    }

    #[test]
    fn long_gap_discounts() {
        let hops = vec![node(0, 1_000, 0), node(1_000, 0, TIME_GAP_SECS + 1)];
        assert!((score_path(&hops) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn single_hop_is_certain() {
        let hops = vec![node(0, 500, 100)];
        assert_eq!(score_path(&hops), 1.0);
    }

    #[test]
    fn score_never_leaves_unit_interval() {
        let hops: Vec<PathNode> = (0..50)
            .map(|i| node(if i == 0 { 0 } else { 100 }, 500, i * TIME_GAP_SECS * 2))
            .collect();
        let score = score_path(&hops);
        assert!((0.0..=1.0).contains(&score));
    }
}
