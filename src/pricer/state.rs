//! Pool state snapshots
//!
//! Fetched per scan tick through the chain client (batched where the chain
//! has a multicall aggregator), cached by (pool, block), and converted to
//! decimals at ingestion. Entries older than two blocks behind head are
//! evicted.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::chain::ChainClient;
use crate::errors::{EngineError, QuoteReason};
use crate::registry::{Pool, PoolKind, Registry};

/// Cache entries survive this many blocks behind head.
const SNAPSHOT_MAX_AGE_BLOCKS: u64 = 2;

sol! {
    interface IPairState {
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
    }

    interface IV3PoolState {
        function slot0() external view returns (
            uint160 sqrtPriceX96,
            int24 tick,
            uint16 observationIndex,
            uint16 observationCardinality,
            uint16 observationCardinalityNext,
            uint8 feeProtocol,
            bool unlocked
        );
        function liquidity() external view returns (uint128);
    }

    interface IStablePoolState {
        function balances(uint256 i) external view returns (uint256);
    }

    interface IErc20Balance {
        function balanceOf(address account) external view returns (uint256);
    }
}

/// Protocol-specific pool state, decimals in human units except the V3
/// sqrt price (raw-unit by definition).
#[derive(Debug, Clone, PartialEq)]
pub enum PoolState {
    V2 {
        reserves: Vec<Decimal>,
    },
    V3 {
        /// sqrt(token1_raw / token0_raw).
        sqrt_price: Decimal,
        /// In-range liquidity, raw units.
        liquidity: Decimal,
        tick: i32,
    },
    Curve {
        balances: Vec<Decimal>,
    },
    Balancer {
        balances: Vec<Decimal>,
    },
}

/// State of one pool as of one block.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSnapshot {
    pub pool: Address,
    pub block: u64,
    pub state: PoolState,
}

/// Convert a raw integer amount into a human-unit decimal.
///
/// Decimals beyond 28 exceed `Decimal`'s scale; digits below 10^-28 of a
/// unit are truncated for such tokens.
pub fn raw_to_decimal(raw: U256, decimals: u8) -> Result<Decimal, QuoteReason> {
    let mut value: u128 = raw.try_into().map_err(|_| QuoteReason::NumericOverflow)?;
    let mut scale = decimals as u32;
    while scale > 28 {
        value /= 10;
        scale -= 1;
    }
    Decimal::try_from_i128_with_scale(value as i128, scale)
        .map_err(|_| QuoteReason::NumericOverflow)
}

/// Convert a human-unit decimal into raw integer units, truncating any
/// precision below one raw unit. The power steps run in U256 so 30-decimals
/// tokens cannot overflow the decimal range.
pub fn decimal_to_raw(amount: Decimal, decimals: u8) -> Result<U256, QuoteReason> {
    if amount.is_sign_negative() {
        return Err(QuoteReason::NumericOverflow);
    }
    let scale = amount.scale();
    let mantissa = U256::from(amount.mantissa() as u128);
    let decimals = decimals as u32;
    let raw = if decimals >= scale {
        mantissa * U256::from(10u64).pow(U256::from(decimals - scale))
    } else {
        mantissa / U256::from(10u64).pow(U256::from(scale - decimals))
    };
    Ok(raw)
}

/// Convert a Q64.96 sqrt price into a decimal, 18 digits of precision.
pub fn sqrt_price_from_x96(x96: U256) -> Result<Decimal, QuoteReason> {
    const SCALE: u128 = 1_000_000_000_000_000_000;
    let scaled: U256 = (x96 * U256::from(SCALE)) >> 96;
    let value: u128 = scaled.try_into().map_err(|_| QuoteReason::NumericOverflow)?;
    Decimal::try_from_i128_with_scale(value as i128, 18).map_err(|_| QuoteReason::NumericOverflow)
}

/// Per-tick pool state cache keyed by (pool, block).
pub struct StateFetcher {
    registry: Arc<Registry>,
    cache: DashMap<(Address, u64), Arc<PoolSnapshot>>,
}

impl StateFetcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self, pool: Address, block: u64) -> Option<Arc<PoolSnapshot>> {
        self.cache.get(&(pool, block)).map(|e| Arc::clone(&e))
    }

    pub fn insert(&self, snapshot: PoolSnapshot) -> Arc<PoolSnapshot> {
        let arc = Arc::new(snapshot);
        self.cache.insert((arc.pool, arc.block), Arc::clone(&arc));
        arc
    }

    /// Drop entries older than the freshness window.
    pub fn evict_stale(&self, head: u64) {
        self.cache
            .retain(|(_, block), _| head.saturating_sub(*block) <= SNAPSHOT_MAX_AGE_BLOCKS);
    }

    /// Number of read calls a pool's state needs.
    fn call_count(pool: &Pool) -> usize {
        match &pool.kind {
            PoolKind::V2 { .. } => 1,
            PoolKind::V3 { .. } => 2,
            PoolKind::Curve { .. } | PoolKind::Balancer { .. } => pool.tokens.len(),
        }
    }

    fn build_calls(pool: &Pool) -> Vec<(Address, Bytes)> {
        match &pool.kind {
            PoolKind::V2 { .. } => vec![(
                pool.address,
                Bytes::from(IPairState::getReservesCall {}.abi_encode()),
            )],
            PoolKind::V3 { .. } => vec![
                (pool.address, Bytes::from(IV3PoolState::slot0Call {}.abi_encode())),
                (pool.address, Bytes::from(IV3PoolState::liquidityCall {}.abi_encode())),
            ],
            PoolKind::Curve { .. } => (0..pool.tokens.len())
                .map(|i| {
                    (
                        pool.address,
                        Bytes::from(
                            IStablePoolState::balancesCall { i: U256::from(i) }.abi_encode(),
                        ),
                    )
                })
                .collect(),
            // Weighted pools hold their tokens directly; balances are plain
            // ERC20 balances of the pool contract.
            PoolKind::Balancer { .. } => pool
                .tokens
                .iter()
                .map(|token| {
                    (
                        *token,
                        Bytes::from(
                            IErc20Balance::balanceOfCall { account: pool.address }.abi_encode(),
                        ),
                    )
                })
                .collect(),
        }
    }

    fn decode_state(&self, pool: &Pool, returns: &[Option<Bytes>]) -> Option<PoolState> {
        match &pool.kind {
            PoolKind::V2 { .. } => {
                let raw = returns.first()?.as_ref()?;
                let decoded = IPairState::getReservesCall::abi_decode_returns(raw).ok()?;
                let decimals0 = self.registry.token(pool.chain, pool.tokens[0])?.decimals;
                let decimals1 = self.registry.token(pool.chain, pool.tokens[1])?.decimals;
                Some(PoolState::V2 {
                    reserves: vec![
                        raw_to_decimal(U256::from(decoded.reserve0), decimals0).ok()?,
                        raw_to_decimal(U256::from(decoded.reserve1), decimals1).ok()?,
                    ],
                })
            }
            PoolKind::V3 { .. } => {
                let slot0_raw = returns.first()?.as_ref()?;
                let liquidity_raw = returns.get(1)?.as_ref()?;
                let slot0 = IV3PoolState::slot0Call::abi_decode_returns(slot0_raw).ok()?;
                let liquidity =
                    IV3PoolState::liquidityCall::abi_decode_returns(liquidity_raw).ok()?;
                Some(PoolState::V3 {
                    sqrt_price: sqrt_price_from_x96(U256::from(slot0.sqrtPriceX96)).ok()?,
                    liquidity: raw_to_decimal(U256::from(liquidity), 0).ok()?,
                    tick: slot0.tick.as_i32(),
                })
            }
            PoolKind::Curve { .. } => {
                let mut balances = Vec::with_capacity(pool.tokens.len());
                for (i, ret) in returns.iter().enumerate() {
                    let raw = ret.as_ref()?;
                    let balance = IStablePoolState::balancesCall::abi_decode_returns(raw).ok()?;
                    let decimals = self.registry.token(pool.chain, pool.tokens[i])?.decimals;
                    balances.push(raw_to_decimal(balance, decimals).ok()?);
                }
                Some(PoolState::Curve { balances })
            }
            PoolKind::Balancer { .. } => {
                let mut balances = Vec::with_capacity(pool.tokens.len());
                for (i, ret) in returns.iter().enumerate() {
                    let raw = ret.as_ref()?;
                    let balance = IErc20Balance::balanceOfCall::abi_decode_returns(raw).ok()?;
                    let decimals = self.registry.token(pool.chain, pool.tokens[i])?.decimals;
                    balances.push(raw_to_decimal(balance, decimals).ok()?);
                }
                Some(PoolState::Balancer { balances })
            }
        }
    }

    /// Fetch state for every pool on a chain at one block. Pools whose reads
    /// fail are skipped (their routes drop out of the tick); a full batch
    /// failure surfaces as an error.
    pub async fn fetch_chain(
        &self,
        client: &ChainClient,
        block: u64,
    ) -> Result<Vec<Arc<PoolSnapshot>>, EngineError> {
        let pools = self.registry.pools(client.chain);
        if pools.is_empty() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::with_capacity(pools.len());
        let mut to_fetch: Vec<&Pool> = Vec::new();
        for pool in pools {
            match self.cached(pool.address, block) {
                Some(snapshot) => snapshots.push(snapshot),
                None => to_fetch.push(pool),
            }
        }
        if to_fetch.is_empty() {
            return Ok(snapshots);
        }

        let mut calls = Vec::new();
        for pool in &to_fetch {
            calls.extend(Self::build_calls(pool));
        }
        let returns = client.batch_call(calls).await?;

        let mut cursor = 0usize;
        for pool in to_fetch {
            let count = Self::call_count(pool);
            let slice = &returns[cursor..cursor + count];
            cursor += count;
            if let Some(state) = self.decode_state(pool, slice) {
                snapshots.push(self.insert(PoolSnapshot {
                    pool: pool.address,
                    block,
                    state,
                }));
            } else {
                tracing::debug!(pool = %pool.address, chain = client.chain, "pool state fetch failed, skipping");
            }
        }

        self.evict_stale(block);
        Ok(snapshots)
    }
}
