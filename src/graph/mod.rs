//! Token-flow path reconstruction.
//!
//! Bounded depth-first expansion over aggregated transfers, forward or
//! backward from a queried address. The cycle-avoidance set is
//! recursion-local: a node is claimed on entry and released on every exit
//! path, so distinct non-overlapping paths may share prefixes. A separate
//! cumulative set enforces the global visited bound.

pub mod confidence;
pub mod types;

pub use types::{CircularFlow, Direction, FlowPath, PathNode, TimeWindow};

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::EntityRegistry;
use crate::storage::Store;
use crate::upstream::{Transfer, TransferSource};
use types::{MAX_DEPTH_CEILING, MAX_PATHS, MAX_VISITED};

/// Transfers fetched per node expansion.
const PER_NODE_FETCH: usize = 100;
/// Counterparties expanded when building cycle adjacency.
const CYCLE_NEIGHBOR_FANOUT: usize = 10;
/// Longest cycle walk, in edges.
const MAX_CYCLE_EDGES: usize = 5;
/// Cycles collected before the walk stops.
const MAX_CYCLES: usize = 100;

/// Reconstructs flow paths and cycles for a token.
pub struct FlowGraphEngine {
    source: Arc<dyn TransferSource>,
    registry: Arc<EntityRegistry>,
    store: Arc<dyn Store>,
}

struct Traversal<'a> {
    engine: &'a FlowGraphEngine,
    token_mint: String,
    direction: Direction,
    max_depth: usize,
    cutoff: i64,
    /// Recursion-local: nodes on the current path
    on_path: HashSet<String>,
    /// Cumulative: every node ever expanded, enforces the visited bound
    seen: HashSet<String>,
    hops: Vec<PathNode>,
    paths: Vec<FlowPath>,
}

impl FlowGraphEngine {
    pub fn new(
        source: Arc<dyn TransferSource>,
        registry: Arc<EntityRegistry>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self { source, registry, store }
    }

    /// Paths flowing out of `start`.
    pub async fn build_forward_paths(
        &self,
        start: &str,
        token_mint: &str,
        max_depth: usize,
        window: TimeWindow,
    ) -> Result<Vec<FlowPath>> {
        self.build_paths(start, token_mint, max_depth, window, Direction::Forward)
            .await
    }

    /// Paths flowing into `end`. Hops are returned origin-first.
    pub async fn build_backward_paths(
        &self,
        end: &str,
        token_mint: &str,
        max_depth: usize,
        window: TimeWindow,
    ) -> Result<Vec<FlowPath>> {
        self.build_paths(end, token_mint, max_depth, window, Direction::Backward)
            .await
    }

    async fn build_paths(
        &self,
        origin: &str,
        token_mint: &str,
        max_depth: usize,
        window: TimeWindow,
        direction: Direction,
    ) -> Result<Vec<FlowPath>> {
        let max_depth = max_depth.clamp(1, MAX_DEPTH_CEILING);
        let now = Utc::now().timestamp();

        let mut traversal = Traversal {
            engine: self,
            token_mint: token_mint.to_string(),
            direction,
            max_depth,
            cutoff: window.cutoff(now),
            on_path: HashSet::new(),
            seen: HashSet::new(),
            hops: Vec::new(),
            paths: Vec::new(),
        };

        let root = self.path_node(origin, 0, None).await?;
        traversal.hops.push(root);
        traversal.expand(origin.to_string(), 0).await?;

        let paths = traversal.paths;
        debug!(
            origin = %origin,
            mint = %token_mint,
            direction = ?direction,
            paths = paths.len(),
            "traversal complete"
        );

        // Persistence is best-effort: enrichment readers attach later.
        for path in &paths {
            if let Err(e) = self.store.upsert_flow_path(path).await {
                warn!(path_id = %path.path_id, error = %e, "flow path persistence failed");
            }
        }
        Ok(paths)
    }

    /// Cycles through `address` for the token: adjacency is built from the
    /// address's transfers plus one ring of counterparties, then walked
    /// depth-first back to the origin.
    pub async fn detect_circular_flows(
        &self,
        address: &str,
        token_mint: &str,
    ) -> Result<Vec<CircularFlow>> {
        let mut transfers = self
            .source
            .token_transfers(address, token_mint, PER_NODE_FETCH)
            .await?;

        let mut neighbors: Vec<String> = Vec::new();
        for t in &transfers {
            for peer in [&t.from_address, &t.to_address] {
                if peer != address && !peer.is_empty() && !neighbors.contains(peer) {
                    neighbors.push(peer.clone());
                }
            }
        }
        for neighbor in neighbors.iter().take(CYCLE_NEIGHBOR_FANOUT) {
            let extra = self
                .source
                .token_transfers(neighbor, token_mint, PER_NODE_FETCH)
                .await?;
            transfers.extend(extra);
        }

        let mut edge_set: HashSet<(String, String, String, u32)> = HashSet::new();
        transfers.retain(|t| {
            edge_set.insert((
                t.signature.clone(),
                t.from_address.clone(),
                t.to_address.clone(),
                t.instruction_index,
            ))
        });

        let mut adjacency: HashMap<&str, Vec<&Transfer>> = HashMap::new();
        for t in &transfers {
            if !t.from_address.is_empty() && !t.to_address.is_empty() {
                adjacency.entry(t.from_address.as_str()).or_default().push(t);
            }
        }

        let mut cycles = Vec::new();
        let mut stack = vec![address.to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        Self::walk_cycles(address, address, &adjacency, &mut stack, &mut visited, &mut cycles);

        let flows = cycles
            .into_iter()
            .map(|cycle| Self::summarize_cycle(cycle, &transfers))
            .collect();
        Ok(flows)
    }

    fn walk_cycles(
        origin: &str,
        current: &str,
        adjacency: &HashMap<&str, Vec<&Transfer>>,
        stack: &mut Vec<String>,
        visited: &mut HashSet<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        if cycles.len() >= MAX_CYCLES || stack.len() > MAX_CYCLE_EDGES {
            return;
        }
        let Some(edges) = adjacency.get(current) else {
            return;
        };
        for edge in edges {
            let next = edge.to_address.as_str();
            if next == origin {
                if stack.len() > 1 {
                    let mut cycle = stack.clone();
                    cycle.push(origin.to_string());
                    if !cycles.contains(&cycle) {
                        cycles.push(cycle);
                    }
                }
                continue;
            }
            if visited.contains(next) || stack.iter().any(|a| a == next) {
                continue;
            }
            stack.push(next.to_string());
            Self::walk_cycles(origin, next, adjacency, stack, visited, cycles);
            stack.pop();
        }
        visited.insert(current.to_string());
    }

    fn summarize_cycle(addresses: Vec<String>, transfers: &[Transfer]) -> CircularFlow {
        let members: HashSet<&str> = addresses.iter().map(String::as_str).collect();
        let total_amount: u128 = transfers
            .iter()
            .filter(|t| {
                members.contains(t.from_address.as_str()) && members.contains(t.to_address.as_str())
            })
            .map(|t| t.amount)
            .sum();

        // How many times the cycle completed: the thinnest edge bounds it.
        let cycle_count = addresses
            .windows(2)
            .map(|pair| {
                transfers
                    .iter()
                    .filter(|t| t.from_address == pair[0] && t.to_address == pair[1])
                    .count() as u32
            })
            .min()
            .unwrap_or(0)
            .max(1);

        CircularFlow { addresses, total_amount, cycle_count }
    }

    async fn path_node(
        &self,
        address: &str,
        amount_in: u128,
        timestamp: Option<i64>,
    ) -> Result<PathNode> {
        let entity = self.registry.resolve(address).await?;
        Ok(PathNode {
            address: address.to_string(),
            entity_kind: entity.as_ref().map(|e| e.entity_kind),
            entity_name: entity.and_then(|e| e.name),
            amount_in,
            amount_out: 0,
            timestamp,
        })
    }
}

impl Traversal<'_> {
    /// Expand one node. The node is claimed in the recursion-local set on
    /// entry and released on every exit, including bound violations.
    fn expand(&mut self, address: String, depth: usize) -> BoxFuture<'_, Result<()>> {
        async move {
            self.on_path.insert(address.clone());
            self.seen.insert(address.clone());
            let result = self.expand_inner(&address, depth).await;
            self.on_path.remove(&address);
            result
        }
        .boxed()
    }

    async fn expand_inner(&mut self, address: &str, depth: usize) -> Result<()> {
        // Safety bounds, checked before every expansion.
        if depth >= self.max_depth
            || self.seen.len() > MAX_VISITED
            || self.paths.len() >= MAX_PATHS
        {
            self.emit_path();
            return Ok(());
        }

        let transfers = self
            .engine
            .source
            .token_transfers(address, &self.token_mint, PER_NODE_FETCH)
            .await?;

        // Aggregate by counterparty: summed amount, earliest block time.
        let mut aggregated: Vec<(String, u128, i64)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for t in &transfers {
            if t.block_time < self.cutoff {
                continue;
            }
            let peer = match self.direction {
                Direction::Forward if t.from_address == address => t.to_address.clone(),
                Direction::Backward if t.to_address == address => t.from_address.clone(),
                _ => continue,
            };
            if peer.is_empty() {
                continue;
            }
            match index.get(&peer) {
                Some(&i) => {
                    aggregated[i].1 = aggregated[i].1.saturating_add(t.amount);
                    aggregated[i].2 = aggregated[i].2.min(t.block_time);
                }
                None => {
                    index.insert(peer.clone(), aggregated.len());
                    aggregated.push((peer, t.amount, t.block_time));
                }
            }
        }

        let expandable: Vec<_> = aggregated
            .into_iter()
            .filter(|(peer, _, _)| !self.on_path.contains(peer))
            .collect();

        if expandable.is_empty() {
            self.emit_path();
            return Ok(());
        }

        for (peer, amount, block_time) in expandable {
            if self.paths.len() >= MAX_PATHS {
                break;
            }
            let node = match self.direction {
                Direction::Forward => {
                    // This branch's outflow from the current hop.
                    if let Some(last) = self.hops.last_mut() {
                        last.amount_out = amount;
                        if last.timestamp.is_none() {
                            last.timestamp = Some(block_time);
                        }
                    }
                    self.engine.path_node(&peer, amount, Some(block_time)).await?
                }
                Direction::Backward => {
                    if let Some(last) = self.hops.last_mut() {
                        last.amount_in = amount;
                        if last.timestamp.is_none() {
                            last.timestamp = Some(block_time);
                        }
                    }
                    let mut node = self.engine.path_node(&peer, 0, Some(block_time)).await?;
                    node.amount_out = amount;
                    node
                }
            };

            self.hops.push(node);
            self.expand(peer, depth + 1).await?;
            self.hops.pop();
        }
        Ok(())
    }

    /// Record the current hop sequence as a finished path.
    fn emit_path(&mut self) {
        if self.hops.is_empty() || self.paths.len() >= MAX_PATHS {
            return;
        }
        // A lone origin with no movement is not a path.
        if self.hops.len() == 1 && self.hops[0].amount_out == 0 && self.hops[0].amount_in == 0 {
            return;
        }

        let mut hops = self.hops.clone();
        if self.direction == Direction::Backward {
            hops.reverse();
        }
        // The terminal hop has no onward flow in this path.
        if let Some(last) = hops.last_mut() {
            if self.direction == Direction::Forward {
                last.amount_out = 0;
            }
        }

        let total_amount = hops.iter().map(PathNode::throughput).sum();
        let confidence_score = confidence::score_path(&hops);
        let start_address = hops.first().map(|h| h.address.clone()).unwrap_or_default();
        let end_address = hops.last().map(|h| h.address.clone()).unwrap_or_default();
        let hop_count = hops.len();

        self.paths.push(FlowPath {
            path_id: Uuid::new_v4(),
            start_address,
            end_address,
            token_mint: self.token_mint.clone(),
            hops,
            total_amount,
            hop_count,
            confidence_score,
            intent: None,
            intent_confidence: None,
            risk_score: None,
            risk_level: None,
        });
    }
}
