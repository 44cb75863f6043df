//! Token multigraph
//!
//! Nodes are (chain, token); edges are pools (one labeled edge per
//! protocol/fee tier and direction) plus BRIDGE edges connecting canonical
//! equivalents across chains. Edge weights carry the raw exchange rate for
//! route rebuilding and a USD-normalized advantage used for DFS pruning.

use alloy::primitives::Address;
use petgraph::graph::{DiGraph, NodeIndex};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::oracle::PriceSet;
use crate::registry::BridgeLane;
use crate::types::ChainId;

/// Graph node key: a token on a chain.
pub type NodeKey = (ChainId, Address);

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeKind {
    Swap { pool: Address, chain: ChainId },
    Bridge { lane: BridgeLane },
}

#[derive(Debug, Clone)]
pub struct EdgeData {
    pub kind: EdgeKind,
    /// Raw out-per-in exchange rate at spot.
    pub rate: Decimal,
    /// Rate normalized by USD values: ~1.0 in an efficient market. The DFS
    /// prunes on products of this.
    pub advantage: Decimal,
}

/// Directed multigraph of swap and bridge relationships.
pub struct TokenGraph {
    pub graph: DiGraph<NodeKey, EdgeData>,
    nodes: HashMap<NodeKey, NodeIndex>,
}

impl Default for TokenGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        }
    }

    fn get_or_create(&mut self, key: NodeKey) -> NodeIndex {
        if let Some(&node) = self.nodes.get(&key) {
            node
        } else {
            let node = self.graph.add_node(key);
            self.nodes.insert(key, node);
            node
        }
    }

    pub fn node(&self, key: NodeKey) -> Option<NodeIndex> {
        self.nodes.get(&key).copied()
    }

    pub fn key(&self, node: NodeIndex) -> Option<NodeKey> {
        self.graph.node_weight(node).copied()
    }

    /// Add one directed swap edge. The caller is responsible for round-trip
    /// sanity checks across the two directions of a pool.
    pub fn add_swap_edge(
        &mut self,
        chain: ChainId,
        pool: Address,
        token_in: Address,
        token_out: Address,
        rate: Decimal,
        advantage: Decimal,
    ) {
        if rate <= Decimal::ZERO || advantage <= Decimal::ZERO {
            tracing::trace!(%pool, "skipping edge with non-positive rate");
            return;
        }
        let from = self.get_or_create((chain, token_in));
        let to = self.get_or_create((chain, token_out));
        self.graph.add_edge(
            from,
            to,
            EdgeData {
                kind: EdgeKind::Swap { pool, chain },
                rate,
                advantage,
            },
        );
    }

    /// Add a BRIDGE edge between canonical equivalents.
    pub fn add_bridge_edge(&mut self, lane: BridgeLane, from_token: Address, to_token: Address) {
        let rate = Decimal::ONE - Decimal::new(lane.fee_bps as i64, 4);
        if rate <= Decimal::ZERO {
            return;
        }
        let from = self.get_or_create((lane.chain_from, from_token));
        let to = self.get_or_create((lane.chain_to, to_token));
        self.graph.add_edge(
            from,
            to,
            EdgeData {
                kind: EdgeKind::Bridge { lane },
                rate,
                // Same canonical token on both sides: USD-normalized
                // advantage equals the fee-discounted rate.
                advantage: rate,
            },
        );
    }

    /// Highest advantage over all edges; the DFS pruning bound.
    pub fn max_advantage(&self) -> Decimal {
        self.graph
            .edge_weights()
            .map(|e| e.advantage)
            .max()
            .unwrap_or(Decimal::ONE)
            .max(Decimal::ONE)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// USD-normalized advantage for a swap edge: rate * usd_out / usd_in.
    pub fn advantage_of(
        rate: Decimal,
        usd_in: Option<Decimal>,
        usd_out: Option<Decimal>,
    ) -> Option<Decimal> {
        match (usd_in, usd_out) {
            (Some(usd_in), Some(usd_out)) if usd_in > Decimal::ZERO => {
                Some(rate * usd_out / usd_in)
            }
            _ => None,
        }
    }
}

/// Convenience: look up a USD price by canonical id.
pub fn usd_of(prices: &PriceSet, canonical: &str) -> Option<Decimal> {
    prices.get(canonical).map(|p| p.price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;
    use rust_decimal_macros::dec;

    #[test]
    fn parallel_edges_per_fee_tier_are_kept() {
        let mut graph = TokenGraph::new();
        // Two pools over the same pair: distinct multi-edges.
        graph.add_swap_edge(1, fixtures::addr(0xC1), fixtures::usdc(), fixtures::weth(), dec!(0.0004), dec!(1));
        graph.add_swap_edge(1, fixtures::addr(0xC2), fixtures::usdc(), fixtures::weth(), dec!(0.00041), dec!(1.02));

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.max_advantage(), dec!(1.02));
    }

    #[test]
    fn bridge_edge_discounts_fee() {
        let mut graph = TokenGraph::new();
        let lane = fixtures::bridges().remove(0);
        graph.add_bridge_edge(lane, fixtures::usdc(), fixtures::usdc_poly());

        assert_eq!(graph.edge_count(), 1);
        let edge = graph.graph.edge_weights().next().unwrap();
        assert_eq!(edge.rate, dec!(0.9996));
        assert!(matches!(edge.kind, EdgeKind::Bridge { .. }));
    }

    #[test]
    fn non_positive_rates_dropped() {
        let mut graph = TokenGraph::new();
        graph.add_swap_edge(1, fixtures::addr(0xC1), fixtures::usdc(), fixtures::weth(), Decimal::ZERO, dec!(1));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn advantage_normalizes_by_usd() {
        // USDC -> WETH at spot: 0.0004 * 2500 / 1 = 1.0
        let advantage =
            TokenGraph::advantage_of(dec!(0.0004), Some(dec!(1)), Some(dec!(2500))).unwrap();
        assert_eq!(advantage, dec!(1.0000));
    }
}
