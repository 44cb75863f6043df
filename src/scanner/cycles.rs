//! Cycle enumeration
//!
//! Bounded DFS from anchor tokens over the token multigraph, up to MAX_HOPS.
//! A partial path is abandoned when its best-possible advantage (current
//! product times the graph's max edge advantage for every remaining hop)
//! falls below 1. A cycle closes on any node carrying the same canonical id
//! as the start, which covers both same-chain loops and bridge routes.

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;

use super::graph::{EdgeData, EdgeKind, NodeKey, TokenGraph};
use crate::registry::Registry;

/// Advantage products above this are treated as corrupt pool data, not
/// opportunity. Real spreads sit far below 50%.
const MAX_CREDIBLE_ADVANTAGE: Decimal = dec!(1.5);

/// One enumerated candidate cycle (structure only; amounts come later).
#[derive(Debug, Clone)]
pub struct Cycle {
    pub start: NodeKey,
    pub edges: Vec<CycleEdge>,
    /// Product of USD-normalized edge advantages.
    pub advantage: Decimal,
}

#[derive(Debug, Clone)]
pub struct CycleEdge {
    pub kind: EdgeKind,
    pub token_in: NodeKey,
    pub token_out: NodeKey,
}

impl Cycle {
    pub fn hop_count(&self) -> usize {
        self.edges.len()
    }

    /// Key for deduplicating the same loop found from different entry points:
    /// the sorted multiset of pool/bridge identities.
    fn dedup_key(&self) -> Vec<String> {
        let mut parts: Vec<String> = self
            .edges
            .iter()
            .map(|e| match &e.kind {
                EdgeKind::Swap { pool, chain } => format!("s:{chain}:{pool}"),
                EdgeKind::Bridge { lane } => {
                    format!("b:{}:{}:{}", lane.provider, lane.chain_from, lane.chain_to)
                }
            })
            .collect();
        parts.sort();
        parts
    }
}

/// Enumerate candidate cycles from every anchor.
pub fn enumerate(
    graph: &TokenGraph,
    registry: &Arc<Registry>,
    max_hops: usize,
) -> Vec<Cycle> {
    let max_advantage = graph.max_advantage();
    let mut cycles = Vec::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();

    for chain in registry.chain_ids() {
        for anchor in registry.anchors(chain) {
            let Some(start) = graph.node((chain, *anchor)) else {
                continue;
            };
            let Some(start_canonical) = canonical_of(registry, (chain, *anchor)) else {
                continue;
            };

            let mut path: Vec<CycleEdge> = Vec::new();
            let mut visited: HashSet<NodeIndex> = HashSet::new();
            visited.insert(start);
            dfs(
                graph,
                registry,
                start,
                &start_canonical,
                start,
                Decimal::ONE,
                max_advantage,
                max_hops,
                &mut path,
                &mut visited,
                &mut cycles,
                &mut seen,
            );
        }
    }

    cycles
}

fn canonical_of(registry: &Arc<Registry>, key: NodeKey) -> Option<String> {
    registry.token(key.0, key.1).map(|t| t.canonical.clone())
}

#[allow(clippy::too_many_arguments)]
fn dfs(
    graph: &TokenGraph,
    registry: &Arc<Registry>,
    start: NodeIndex,
    start_canonical: &str,
    current: NodeIndex,
    product: Decimal,
    max_advantage: Decimal,
    max_hops: usize,
    path: &mut Vec<CycleEdge>,
    visited: &mut HashSet<NodeIndex>,
    cycles: &mut Vec<Cycle>,
    seen: &mut HashSet<Vec<String>>,
) {
    if path.len() >= max_hops {
        return;
    }

    for edge in graph.graph.edges(current) {
        let data: &EdgeData = edge.weight();
        let target = edge.target();
        let Some(target_key) = graph.key(target) else {
            continue;
        };
        let Some(current_key) = graph.key(current) else {
            continue;
        };

        let next_product = product * data.advantage;
        let remaining = max_hops - path.len() - 1;
        // Best possible: every remaining hop lands the best edge in the graph.
        let best_possible = next_product
            * max_advantage.powi(remaining as i64);
        if best_possible < Decimal::ONE {
            continue;
        }

        let same_family = target == start
            || canonical_of(registry, target_key).as_deref() == Some(start_canonical);

        // Reaching the start's canonical family after at least one hop
        // closes the cycle; a bridge as the very first hop instead moves
        // within the family and keeps searching.
        if same_family && !path.is_empty() {
            if next_product > Decimal::ONE && next_product <= MAX_CREDIBLE_ADVANTAGE {
                let mut edges = path.clone();
                edges.push(CycleEdge {
                    kind: data.kind.clone(),
                    token_in: current_key,
                    token_out: target_key,
                });
                let candidate = Cycle {
                    start: graph.key(start).expect("start node exists"),
                    edges,
                    advantage: next_product,
                };
                if seen.insert(candidate.dedup_key()) {
                    cycles.push(candidate);
                }
            }
            continue;
        }
        if same_family && !matches!(data.kind, EdgeKind::Bridge { .. }) {
            continue;
        }

        if visited.contains(&target) {
            continue;
        }

        visited.insert(target);
        path.push(CycleEdge {
            kind: data.kind.clone(),
            token_in: current_key,
            token_out: target_key,
        });
        dfs(
            graph,
            registry,
            start,
            start_canonical,
            target,
            next_product,
            max_advantage,
            max_hops,
            path,
            visited,
            cycles,
            seen,
        );
        path.pop();
        visited.remove(&target);
    }
}
