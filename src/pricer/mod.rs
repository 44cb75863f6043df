//! DEX Pricer
//!
//! Pure pricing functions per pool variant plus the per-tick state cache.
//! A pricing call either returns a quote or an explicit `QuoteUnavailable`
//! reason, never a silent zero.

pub mod balancer;
pub mod curve;
pub mod state;
pub mod v2;
pub mod v3;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::errors::QuoteReason;
use crate::registry::{Pool, PoolKind, Registry};
use crate::types::Quote;
use state::{PoolSnapshot, PoolState};

pub use state::StateFetcher;

/// Stateless quote computation over fetched pool snapshots.
pub struct Pricer {
    registry: Arc<Registry>,
}

impl Pricer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Price one swap hop. `amount_in` is in human units of `token_in`.
    pub fn quote(
        &self,
        pool: &Pool,
        snapshot: &PoolSnapshot,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Result<Quote, QuoteReason> {
        let index_in = pool.token_index(token_in).ok_or(QuoteReason::TokenMismatch)?;
        let index_out = pool.token_index(token_out).ok_or(QuoteReason::TokenMismatch)?;
        if index_in == index_out {
            return Err(QuoteReason::TokenMismatch);
        }

        let (amount_out, depth_used) = match (&pool.kind, &snapshot.state) {
            (PoolKind::V2 { .. }, PoolState::V2 { reserves }) => v2::amount_out(
                reserves[index_in],
                reserves[index_out],
                amount_in,
                pool.kind.fee_fraction(),
            )?,
            (PoolKind::V3 { .. }, PoolState::V3 { sqrt_price, liquidity, .. }) => {
                self.quote_v3(pool, *sqrt_price, *liquidity, index_in, amount_in)?
            }
            (PoolKind::Curve { amplification, .. }, PoolState::Curve { balances }) => {
                curve::amount_out(
                    balances,
                    *amplification,
                    index_in,
                    index_out,
                    amount_in,
                    pool.kind.fee_fraction(),
                )?
            }
            (PoolKind::Balancer { weights, .. }, PoolState::Balancer { balances }) => {
                balancer::amount_out(
                    balances[index_in],
                    weights[index_in],
                    balances[index_out],
                    weights[index_out],
                    amount_in,
                    pool.kind.fee_fraction(),
                )?
            }
            _ => return Err(QuoteReason::StateUnavailable),
        };

        if amount_out <= Decimal::ZERO {
            return Err(QuoteReason::InsufficientLiquidity);
        }

        Ok(Quote {
            chain: pool.chain,
            pool: pool.address,
            token_in,
            token_out,
            amount_in,
            amount_out,
            effective_price: amount_out / amount_in,
            depth_used,
            source_block: snapshot.block,
            observed_at,
        })
    }

    /// V3 math runs in raw units; convert at the boundary and back.
    fn quote_v3(
        &self,
        pool: &Pool,
        sqrt_price: Decimal,
        liquidity: Decimal,
        index_in: usize,
        amount_in: Decimal,
    ) -> Result<(Decimal, Decimal), QuoteReason> {
        let token_in = self
            .registry
            .token(pool.chain, pool.tokens[index_in])
            .ok_or(QuoteReason::TokenMismatch)?;
        let token_out = self
            .registry
            .token(pool.chain, pool.tokens[1 - index_in])
            .ok_or(QuoteReason::TokenMismatch)?;

        let zero_for_one = index_in == 0;
        let scale_in = pow10(token_in.decimals)?;
        let amount_in_raw = amount_in
            .checked_mul(scale_in)
            .ok_or(QuoteReason::NumericOverflow)?;

        let (out_raw, depth_used) = v3::amount_out(
            sqrt_price,
            liquidity,
            zero_for_one,
            amount_in_raw,
            pool.kind.fee_fraction(),
        )?;

        let scale_out = pow10(token_out.decimals)?;
        Ok((out_raw / scale_out, depth_used))
    }

    /// Spot exchange rate (out per in) for graph edge weights. Uses a probe
    /// trade of 1e-6 of the available depth so large pools stay linear.
    pub fn spot_rate(
        &self,
        pool: &Pool,
        snapshot: &PoolSnapshot,
        token_in: Address,
        token_out: Address,
    ) -> Option<Decimal> {
        let probe = self.probe_amount(pool, snapshot, token_in)?;
        let quote = self
            .quote(pool, snapshot, token_in, token_out, probe, Utc::now())
            .ok()?;
        Some(quote.effective_price)
    }

    /// A trade size small enough to read the marginal price.
    fn probe_amount(
        &self,
        pool: &Pool,
        snapshot: &PoolSnapshot,
        token_in: Address,
    ) -> Option<Decimal> {
        let available = self.available_depth(pool, snapshot, token_in)?;
        let probe = available * Decimal::new(1, 6);
        (probe > Decimal::ZERO).then_some(probe)
    }

    /// Usable input-side depth of a pool in human units of `token_in`.
    /// Trade sizing caps at a configured share of this.
    pub fn available_depth(
        &self,
        pool: &Pool,
        snapshot: &PoolSnapshot,
        token_in: Address,
    ) -> Option<Decimal> {
        let index_in = pool.token_index(token_in)?;
        let available = match &snapshot.state {
            PoolState::V2 { reserves } => reserves.get(index_in).copied()?,
            PoolState::Curve { balances } | PoolState::Balancer { balances } => {
                balances.get(index_in).copied()?
            }
            PoolState::V3 { sqrt_price, liquidity, .. } => {
                // Virtual in-range reserve on the input side, human units.
                let token = self.registry.token(pool.chain, token_in)?;
                let raw = if index_in == 0 {
                    *liquidity / *sqrt_price
                } else {
                    liquidity.checked_mul(*sqrt_price)?
                };
                raw / pow10(token.decimals).ok()?
            }
        };
        (available > Decimal::ZERO).then_some(available)
    }
}

fn pow10(decimals: u8) -> Result<Decimal, QuoteReason> {
    if decimals > 28 {
        // Beyond Decimal's scale; callers convert via U256 instead.
        return Err(QuoteReason::NumericOverflow);
    }
    Ok(Decimal::from_i128_with_scale(10i128.pow(decimals as u32), 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;
    use rust_decimal_macros::dec;

    fn snapshot_v2(pool: Address, r0: Decimal, r1: Decimal) -> PoolSnapshot {
        PoolSnapshot {
            pool,
            block: 100,
            state: PoolState::V2 { reserves: vec![r0, r1] },
        }
    }

    #[test]
    fn v2_quote_produces_consistent_fields() {
        let registry = fixtures::registry();
        let pricer = Pricer::new(Arc::clone(&registry));
        let pool = registry.pool(1, fixtures::addr(0xC1)).unwrap();
        // 5M USDC / 2000 WETH -> price 2500.
        let snapshot = snapshot_v2(pool.address, dec!(5000000), dec!(2000));

        let quote = pricer
            .quote(pool, &snapshot, fixtures::usdc(), fixtures::weth(), dec!(1000), Utc::now())
            .unwrap();
        assert!(quote.amount_out > dec!(0.39) && quote.amount_out < dec!(0.4));
        assert_eq!(quote.effective_price, quote.amount_out / dec!(1000));
        assert_eq!(quote.source_block, 100);
    }

    #[test]
    fn mismatched_state_yields_unavailable() {
        let registry = fixtures::registry();
        let pricer = Pricer::new(Arc::clone(&registry));
        // V3 pool paired with V2-shaped state.
        let pool = registry.pool(1, fixtures::addr(0xC2)).unwrap();
        let snapshot = snapshot_v2(pool.address, dec!(1), dec!(1));

        let err = pricer
            .quote(pool, &snapshot, fixtures::usdc(), fixtures::weth(), dec!(10), Utc::now())
            .unwrap_err();
        assert_eq!(err, QuoteReason::StateUnavailable);
    }

    #[test]
    fn unknown_token_yields_mismatch() {
        let registry = fixtures::registry();
        let pricer = Pricer::new(Arc::clone(&registry));
        let pool = registry.pool(1, fixtures::addr(0xC1)).unwrap();
        let snapshot = snapshot_v2(pool.address, dec!(1000), dec!(1000));

        let err = pricer
            .quote(pool, &snapshot, fixtures::dai(), fixtures::weth(), dec!(10), Utc::now())
            .unwrap_err();
        assert_eq!(err, QuoteReason::TokenMismatch);
    }

    #[test]
    fn curve_quote_through_dispatch() {
        let registry = fixtures::registry();
        let pricer = Pricer::new(Arc::clone(&registry));
        let pool = registry.pool(1, fixtures::addr(0xC3)).unwrap();
        let snapshot = PoolSnapshot {
            pool: pool.address,
            block: 100,
            state: PoolState::Curve { balances: vec![dec!(2000000), dec!(2000000)] },
        };

        let quote = pricer
            .quote(pool, &snapshot, fixtures::usdc(), fixtures::dai(), dec!(5000), Utc::now())
            .unwrap();
        // Stable pair near parity, 4 bps fee.
        assert!(quote.amount_out > dec!(4990) && quote.amount_out < dec!(5000));
    }

    #[test]
    fn spot_rate_reads_marginal_price() {
        let registry = fixtures::registry();
        let pricer = Pricer::new(Arc::clone(&registry));
        let pool = registry.pool(1, fixtures::addr(0xC1)).unwrap();
        let snapshot = snapshot_v2(pool.address, dec!(5000000), dec!(2000));

        let rate = pricer
            .spot_rate(pool, &snapshot, fixtures::usdc(), fixtures::weth())
            .unwrap();
        // Marginal price ~ 1/2500 WETH per USDC, less the 30 bps fee.
        assert!(rate > dec!(0.000398) && rate < dec!(0.0004), "rate = {rate}");
    }
}
