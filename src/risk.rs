//! Proximity-based risk scoring.
//!
//! Independent checks accumulate into one 0-100 score: sanction and mixer
//! proximity over a bounded forward BFS, peel-chain and velocity patterns
//! over the address's outbound transfers, and circular flows from the
//! graph engine. A direct sanction hit short-circuits to 100.

use anyhow::Result;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::entities::EntityRegistry;
use crate::graph::FlowGraphEngine;
use crate::storage::models::{EntityKind, FlagSeverity, RiskFlag, RiskLevel};
use crate::storage::Store;
use crate::upstream::{Transfer, TransferSource};

/// Assessment cache lifetime.
const ASSESSMENT_TTL: Duration = Duration::from_secs(600);
/// Proximity BFS depth.
const PROXIMITY_DEPTH: usize = 2;
/// Proximity BFS fan-out per node.
const PROXIMITY_FANOUT: usize = 10;
/// Transfers fetched per address for the behavioral checks.
const BEHAVIOR_FETCH: usize = 200;

/// Peel-chain ratio band.
const PEEL_RATIO_MIN: f64 = 0.85;
const PEEL_RATIO_MAX: f64 = 0.95;
/// Consecutive qualifying hops required.
const PEEL_MIN_CHAIN: usize = 3;
/// Outbound transfers per hour marking abnormal velocity.
const VELOCITY_PER_HOUR: usize = 100;

/// Check weights.
const WEIGHT_SANCTIONED_PROXIMITY: u32 = 50;
const WEIGHT_MIXER_PROXIMITY: u32 = 40;
const WEIGHT_PEEL_CHAIN: u32 = 35;
const WEIGHT_CIRCULAR_FLOW: u32 = 25;
const WEIGHT_VELOCITY: u32 = 20;

/// Outcome of one address assessment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RiskAssessment {
    pub address: String,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub flags: Vec<RiskFlag>,
    pub last_assessed: DateTime<Utc>,
}

/// Risk scoring engine. Shares the upstream, registry and graph engine
/// with the rest of the service.
pub struct RiskEngine {
    source: Arc<dyn TransferSource>,
    registry: Arc<EntityRegistry>,
    graph: Arc<FlowGraphEngine>,
    store: Arc<dyn Store>,
    cache: Cache<String, RiskAssessment>,
}

impl RiskEngine {
    pub fn new(
        source: Arc<dyn TransferSource>,
        registry: Arc<EntityRegistry>,
        graph: Arc<FlowGraphEngine>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            source,
            registry,
            graph,
            store,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ASSESSMENT_TTL)
                .build(),
        }
    }

    /// Assess an address relative to a token. Cached for ten minutes.
    pub async fn assess(&self, address: &str, token_mint: &str) -> Result<RiskAssessment> {
        let cache_key = format!("{}:{}", address, token_mint);
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let assessment = self.assess_uncached(address, token_mint).await?;

        // Cache the outcome on the entity row plus a flag history.
        if let Err(e) = self
            .store
            .update_entity_risk(address, assessment.risk_score, assessment.risk_level)
            .await
        {
            warn!(address = %address, error = %e, "entity risk persistence failed");
        }
        if !assessment.flags.is_empty() {
            if let Err(e) = self
                .store
                .insert_risk_flags(address, &assessment.flags, assessment.last_assessed)
                .await
            {
                warn!(address = %address, error = %e, "risk flag persistence failed");
            }
        }

        self.cache.insert(cache_key, assessment.clone()).await;
        Ok(assessment)
    }

    async fn assess_uncached(&self, address: &str, token_mint: &str) -> Result<RiskAssessment> {
        let sanctioned = self.registry.addresses_of_kind(EntityKind::Sanctioned).await?;
        let mixers = self.registry.addresses_of_kind(EntityKind::Mixer).await?;

        // Direct sanction hit short-circuits everything else.
        if sanctioned.contains(address) {
            let flags = vec![RiskFlag {
                flag_type: "sanctioned_direct".into(),
                severity: FlagSeverity::Critical,
                description: "address appears on the sanction list".into(),
                details: serde_json::json!({ "address": address }),
            }];
            return Ok(RiskAssessment {
                address: address.to_string(),
                risk_score: 100,
                risk_level: RiskLevel::Critical,
                flags,
                last_assessed: Utc::now(),
            });
        }

        let mut score: u32 = 0;
        let mut flags: Vec<RiskFlag> = Vec::new();

        let reachable = self.proximity_set(address, token_mint).await?;

        if let Some(hit) = reachable.iter().find(|a| sanctioned.contains(*a)) {
            score += WEIGHT_SANCTIONED_PROXIMITY;
            flags.push(RiskFlag {
                flag_type: "sanctioned_proximity".into(),
                severity: FlagSeverity::Critical,
                description: format!("sanctioned address within {} hops", PROXIMITY_DEPTH),
                details: serde_json::json!({ "matched": hit, "max_hops": PROXIMITY_DEPTH }),
            });
        }
        if let Some(hit) = reachable.iter().find(|a| mixers.contains(*a)) {
            score += WEIGHT_MIXER_PROXIMITY;
            flags.push(RiskFlag {
                flag_type: "mixer_proximity".into(),
                severity: FlagSeverity::Critical,
                description: format!("mixer within {} hops", PROXIMITY_DEPTH),
                details: serde_json::json!({ "matched": hit, "max_hops": PROXIMITY_DEPTH }),
            });
        }

        let transfers = self
            .source
            .token_transfers(address, token_mint, BEHAVIOR_FETCH)
            .await?;
        let mut outbound: Vec<&Transfer> = transfers
            .iter()
            .filter(|t| t.from_address == address)
            .collect();
        outbound.sort_by_key(|t| t.block_time);

        let peel = longest_peel_chain(&outbound);
        if peel >= PEEL_MIN_CHAIN {
            score += WEIGHT_PEEL_CHAIN;
            flags.push(RiskFlag {
                flag_type: "peel_chain".into(),
                severity: FlagSeverity::Critical,
                description: "successive outbound transfers peel a near-constant share".into(),
                details: serde_json::json!({ "chain_length": peel }),
            });
        }

        let cycles = self.graph.detect_circular_flows(address, token_mint).await?;
        if let Some(cycle) = cycles.first() {
            score += WEIGHT_CIRCULAR_FLOW;
            flags.push(RiskFlag {
                flag_type: "circular_flow".into(),
                severity: FlagSeverity::Warning,
                description: "funds return to the origin through a cycle".into(),
                details: serde_json::json!({
                    "addresses": cycle.addresses,
                    "cycle_count": cycle.cycle_count,
                }),
            });
        }

        let velocity = peak_hourly_outbound(&outbound);
        if velocity > VELOCITY_PER_HOUR {
            score += WEIGHT_VELOCITY;
            flags.push(RiskFlag {
                flag_type: "high_velocity".into(),
                severity: FlagSeverity::Warning,
                description: "abnormal outbound transfer rate".into(),
                details: serde_json::json!({ "transfers_per_hour": velocity }),
            });
        }

        let risk_score = score.min(100) as u8;
        debug!(address = %address, score = risk_score, flags = flags.len(), "risk assessed");
        Ok(RiskAssessment {
            address: address.to_string(),
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            flags,
            last_assessed: Utc::now(),
        })
    }

    /// Addresses reachable from `address` within the proximity depth,
    /// following outbound transfers with a bounded fan-out per node.
    async fn proximity_set(&self, address: &str, token_mint: &str) -> Result<HashSet<String>> {
        let mut reachable: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = vec![address.to_string()];

        for _ in 0..PROXIMITY_DEPTH {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                let transfers = self
                    .source
                    .token_transfers(node, token_mint, PROXIMITY_FANOUT * 4)
                    .await?;
                let mut fanout = 0usize;
                for t in transfers.iter().filter(|t| &t.from_address == node) {
                    if fanout >= PROXIMITY_FANOUT {
                        break;
                    }
                    let dest = t.to_address.clone();
                    if dest.is_empty() || dest == address {
                        continue;
                    }
                    if reachable.insert(dest.clone()) {
                        next_frontier.push(dest);
                        fanout += 1;
                    }
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }
        Ok(reachable)
    }
}

/// Longest run of consecutive outbound transfers whose amount ratio to
/// the previous transfer falls in the peel band.
fn longest_peel_chain(outbound: &[&Transfer]) -> usize {
    let mut longest = 0usize;
    let mut run = 0usize;
    for pair in outbound.windows(2) {
        let prev = pair[0].amount;
        let curr = pair[1].amount;
        if prev == 0 {
            run = 0;
            continue;
        }
        let ratio = curr as f64 / prev as f64;
        if (PEEL_RATIO_MIN..=PEEL_RATIO_MAX).contains(&ratio) {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

/// Peak number of outbound transfers in any clock hour.
fn peak_hourly_outbound(outbound: &[&Transfer]) -> usize {
    let mut buckets: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
    for t in outbound {
        *buckets.entry(t.block_time.div_euclid(3600)).or_default() += 1;
    }
    buckets.values().copied().max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::types::TxType;

    fn transfer(from: &str, to: &str, amount: u128, block_time: i64) -> Transfer {
        Transfer {
            signature: format!("sig-{}-{}-{}", from, to, block_time),
            from_address: from.into(),
            to_address: to.into(),
            token_mint: "Mint".into(),
            amount,
            decimals: 6,
            instruction_index: 0,
            block_time,
            tx_type: TxType::Transfer,
            swap_direction: None,
            swap_info: None,
        }
    }

    #[test]
    fn peel_chain_detects_descending_run() {
        let transfers = vec![
            transfer("x", "a", 1000, 100),
            transfer("x", "b", 920, 200),
            transfer("x", "c", 850, 300),
            transfer("x", "d", 780, 400),
        ];
        let outbound: Vec<&Transfer> = transfers.iter().collect();
        assert_eq!(longest_peel_chain(&outbound), 3);
    }

    #[test]
    fn peel_chain_run_breaks_on_out_of_band_ratio() {
        let transfers = vec![
            transfer("x", "a", 1000, 100),
            transfer("x", "b", 920, 200),
            // ratio 0.5 breaks the run
            transfer("x", "c", 460, 300),
            transfer("x", "d", 420, 400),
        ];
        let outbound: Vec<&Transfer> = transfers.iter().collect();
        assert_eq!(longest_peel_chain(&outbound), 1);
    }

    #[test]
    fn velocity_peaks_per_clock_hour() {
        let mut transfers = Vec::new();
        for i in 0..150 {
            transfers.push(transfer("x", "y", 10, 7200 + i));
        }
        for i in 0..20 {
            transfers.push(transfer("x", "y", 10, 90_000 + i));
        }
        let outbound: Vec<&Transfer> = transfers.iter().collect();
        assert_eq!(peak_hourly_outbound(&outbound), 150);
    }
}
