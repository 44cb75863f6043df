//! Token, pool and flash-loan provider registry
//!
//! Loaded once at boot from a JSON file, immutable afterwards and shared
//! without locks. Tokens carry a canonical id used as the cross-chain
//! equivalence key; flash-loan providers are ranked with 0-bps providers
//! always ahead of fee-charging ones on the same chain.

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::errors::EngineError;
use crate::types::ChainId;

/// A token on one chain. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub chain: ChainId,
    pub decimals: u8,
    pub symbol: String,
    /// Cross-chain equivalence key (e.g. "usd-coin").
    pub canonical: String,
}

/// Protocol-specific pool parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum PoolKind {
    /// Constant-product x*y=k with a swap fee.
    V2 { fee_bps: u32 },
    /// Concentrated liquidity; fee tier in hundredths of a bip (500 = 0.05%).
    V3 { fee_ppm: u32 },
    /// Stable-swap invariant with an amplification coefficient.
    Curve { amplification: u64, fee_bps: u32 },
    /// Weighted product invariant; one weight per pool token, summing to 1.
    Balancer { swap_fee_bps: u32, weights: Vec<Decimal> },
}

impl PoolKind {
    pub fn tag(&self) -> &'static str {
        match self {
            PoolKind::V2 { .. } => "v2",
            PoolKind::V3 { .. } => "v3",
            PoolKind::Curve { .. } => "curve",
            PoolKind::Balancer { .. } => "balancer",
        }
    }

    /// Swap fee as a decimal fraction (0.003 for 30 bps).
    pub fn fee_fraction(&self) -> Decimal {
        match self {
            PoolKind::V2 { fee_bps } => Decimal::new(*fee_bps as i64, 4),
            PoolKind::V3 { fee_ppm } => Decimal::new(*fee_ppm as i64, 6),
            PoolKind::Curve { fee_bps, .. } => Decimal::new(*fee_bps as i64, 4),
            PoolKind::Balancer { swap_fee_bps, .. } => Decimal::new(*swap_fee_bps as i64, 4),
        }
    }
}

/// A liquidity pool. `tokens` is the pool's own ordering (pair or triple).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub address: Address,
    pub chain: ChainId,
    pub tokens: Vec<Address>,
    #[serde(flatten)]
    pub kind: PoolKind,
}

impl Pool {
    pub fn token_index(&self, token: Address) -> Option<usize> {
        self.tokens.iter().position(|t| *t == token)
    }

    pub fn contains(&self, token: Address) -> bool {
        self.token_index(token).is_some()
    }
}

/// Flash loan provider descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashProvider {
    pub id: String,
    pub chain: ChainId,
    pub vault: Address,
    pub fee_bps: u32,
    /// Lower rank = preferred among providers with the same fee class.
    pub rank: u32,
}

impl FlashProvider {
    pub fn fee_fraction(&self) -> Decimal {
        Decimal::new(self.fee_bps as i64, 4)
    }
}

/// A bridge lane between two chains for one canonical token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeLane {
    pub provider: String,
    pub chain_from: ChainId,
    pub chain_to: ChainId,
    pub canonical: String,
    pub fee_bps: u32,
}

/// Per-chain on-chain addresses and scan anchors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainMeta {
    pub chain_id: ChainId,
    pub name: String,
    /// Executor contract the engine dispatches encoded routes to.
    pub executor: Address,
    /// Multicall aggregator; absent means per-pool calls.
    pub multicall: Option<Address>,
    /// Canonical id of the native gas token (for gas USD pricing).
    pub native_canonical: String,
    /// Cycle enumeration starts from these tokens.
    pub anchors: Vec<Address>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    chains: Vec<ChainMeta>,
    tokens: Vec<Token>,
    pools: Vec<Pool>,
    flash_providers: Vec<FlashProvider>,
    #[serde(default)]
    bridges: Vec<BridgeLane>,
}

/// Read-only registry shared by every component.
#[derive(Debug)]
pub struct Registry {
    chains: HashMap<ChainId, ChainMeta>,
    tokens: HashMap<(ChainId, Address), Token>,
    by_symbol: HashMap<(ChainId, String), Address>,
    by_canonical: HashMap<String, Vec<(ChainId, Address)>>,
    pools: HashMap<ChainId, Vec<Pool>>,
    pool_index: HashMap<(ChainId, Address), Pool>,
    /// Sorted: 0-bps first, then ascending rank.
    providers: HashMap<ChainId, Vec<FlashProvider>>,
    provider_index: HashMap<String, FlashProvider>,
    bridges: Vec<BridgeLane>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigInvalid(format!("registry {}: {e}", path.display()))
        })?;
        let file: RegistryFile = serde_json::from_str(&raw).map_err(|e| {
            EngineError::ConfigInvalid(format!("registry {}: {e}", path.display()))
        })?;
        Self::from_parts(file.chains, file.tokens, file.pools, file.flash_providers, file.bridges)
    }

    pub fn from_parts(
        chains: Vec<ChainMeta>,
        tokens: Vec<Token>,
        pools: Vec<Pool>,
        providers: Vec<FlashProvider>,
        bridges: Vec<BridgeLane>,
    ) -> Result<Self, EngineError> {
        let mut registry = Registry {
            chains: HashMap::new(),
            tokens: HashMap::new(),
            by_symbol: HashMap::new(),
            by_canonical: HashMap::new(),
            pools: HashMap::new(),
            pool_index: HashMap::new(),
            providers: HashMap::new(),
            provider_index: HashMap::new(),
            bridges,
        };

        for chain in chains {
            if registry.chains.insert(chain.chain_id, chain).is_some() {
                return Err(EngineError::ConfigInvalid("duplicate chain entry".into()));
            }
        }

        for token in tokens {
            let key = (token.chain, token.address);
            registry
                .by_symbol
                .insert((token.chain, token.symbol.clone()), token.address);
            registry
                .by_canonical
                .entry(token.canonical.clone())
                .or_default()
                .push(key);
            if registry.tokens.insert(key, token).is_some() {
                return Err(EngineError::ConfigInvalid(format!(
                    "duplicate token entry for chain {} address {}",
                    key.0, key.1
                )));
            }
        }

        for pool in pools {
            if pool.tokens.len() < 2 || pool.tokens.len() > 3 {
                return Err(EngineError::ConfigInvalid(format!(
                    "pool {} must hold a pair or triple",
                    pool.address
                )));
            }
            if let PoolKind::Balancer { weights, .. } = &pool.kind {
                if weights.len() != pool.tokens.len() {
                    return Err(EngineError::ConfigInvalid(format!(
                        "pool {} weight count mismatch",
                        pool.address
                    )));
                }
            }
            for token in &pool.tokens {
                if !registry.tokens.contains_key(&(pool.chain, *token)) {
                    return Err(EngineError::ConfigInvalid(format!(
                        "pool {} references unknown token {token}",
                        pool.address
                    )));
                }
            }
            let key = (pool.chain, pool.address);
            if registry.pool_index.insert(key, pool.clone()).is_some() {
                return Err(EngineError::ConfigInvalid(format!(
                    "duplicate pool entry {}",
                    pool.address
                )));
            }
            registry.pools.entry(pool.chain).or_default().push(pool);
        }

        for provider in providers {
            if registry
                .provider_index
                .insert(provider.id.clone(), provider.clone())
                .is_some()
            {
                return Err(EngineError::ConfigInvalid(format!(
                    "duplicate flash provider '{}'",
                    provider.id
                )));
            }
            registry.providers.entry(provider.chain).or_default().push(provider);
        }
        // Zero-fee providers outrank every fee-charging provider on the chain.
        for list in registry.providers.values_mut() {
            list.sort_by_key(|p| (p.fee_bps != 0, p.rank, p.fee_bps));
        }

        Ok(registry)
    }

    pub fn chain(&self, chain: ChainId) -> Option<&ChainMeta> {
        self.chains.get(&chain)
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.chains.keys().copied()
    }

    pub fn token(&self, chain: ChainId, address: Address) -> Option<&Token> {
        self.tokens.get(&(chain, address))
    }

    pub fn token_by_symbol(&self, chain: ChainId, symbol: &str) -> Option<&Token> {
        let address = self.by_symbol.get(&(chain, symbol.to_string()))?;
        self.token(chain, *address)
    }

    /// All tokens sharing a canonical id across chains.
    pub fn equivalents(&self, canonical: &str) -> Vec<&Token> {
        self.by_canonical
            .get(canonical)
            .map(|keys| keys.iter().filter_map(|k| self.tokens.get(k)).collect())
            .unwrap_or_default()
    }

    /// The canonical equivalent of a token on another chain, if listed.
    pub fn equivalent_on(&self, canonical: &str, chain: ChainId) -> Option<&Token> {
        self.equivalents(canonical).into_iter().find(|t| t.chain == chain)
    }

    pub fn pools(&self, chain: ChainId) -> &[Pool] {
        self.pools.get(&chain).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn pool(&self, chain: ChainId, address: Address) -> Option<&Pool> {
        self.pool_index.get(&(chain, address))
    }

    /// Providers for a chain, best first.
    pub fn providers(&self, chain: ChainId) -> &[FlashProvider] {
        self.providers.get(&chain).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn provider(&self, id: &str) -> Option<&FlashProvider> {
        self.provider_index.get(id)
    }

    /// Preferred provider for a chain: the configured id when it lives on
    /// that chain, otherwise the best-ranked one.
    pub fn preferred_provider(&self, chain: ChainId, configured: &str) -> Option<&FlashProvider> {
        if let Some(p) = self.provider(configured) {
            if p.chain == chain {
                return Some(p);
            }
        }
        self.providers(chain).first()
    }

    pub fn anchors(&self, chain: ChainId) -> &[Address] {
        self.chain(chain).map(|c| c.anchors.as_slice()).unwrap_or_default()
    }

    pub fn bridges_from(&self, chain: ChainId) -> impl Iterator<Item = &BridgeLane> {
        self.bridges.iter().filter(move |b| b.chain_from == chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;

    #[test]
    fn zero_fee_provider_outranks_cheaper_rank() {
        let registry = fixtures::registry();
        let providers = registry.providers(1);
        assert!(providers.len() >= 2);
        // balancer-v2 charges 0 bps and must come first even though aave-v3
        // carries a better rank number.
        assert_eq!(providers[0].id, "balancer-v2");
        assert_eq!(providers[0].fee_bps, 0);
    }

    #[test]
    fn lookup_by_symbol_and_canonical() {
        let registry = fixtures::registry();
        let usdc = registry.token_by_symbol(1, "USDC").unwrap();
        assert_eq!(usdc.canonical, "usd-coin");

        let equivalents = registry.equivalents("usd-coin");
        assert!(equivalents.len() >= 2, "usd-coin should exist on both chains");
        assert!(registry.equivalent_on("usd-coin", 137).is_some());
    }

    #[test]
    fn duplicate_token_rejected() {
        let mut tokens = fixtures::tokens();
        tokens.push(tokens[0].clone());
        let err = Registry::from_parts(
            fixtures::chains(),
            tokens,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn pool_with_unknown_token_rejected() {
        let mut pools = fixtures::pools();
        pools[0].tokens[0] = Address::repeat_byte(0xEE);
        let err = Registry::from_parts(
            fixtures::chains(),
            fixtures::tokens(),
            pools,
            Vec::new(),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn preferred_provider_falls_back_to_best_ranked() {
        let registry = fixtures::registry();
        // Configured provider lives on chain 1, so chain 137 falls back.
        let provider = registry.preferred_provider(137, "balancer-v2").unwrap();
        assert_eq!(provider.chain, 137);
    }
}
