//! Profit Engine
//!
//! Single responsibility: given a route candidate, produce an opportunity or
//! reject it. All math is decimal-exact in USD; `net_profit` is derived by
//! subtraction so the fee breakdown reconciles with zero drift. The 2x gas
//! floor here is the same rule the execution engine re-checks at simulation
//! time with fresh data.

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;

use crate::oracle::PriceSet;
use crate::registry::{FlashProvider, Registry};
use crate::types::{Confidence, FeeBreakdown, Hop, Opportunity, Route};

/// Why a candidate was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfitRejection {
    BelowMinProfit { net: Decimal },
    BelowGasFloor { net: Decimal, gas: Decimal },
    /// A USD rate the formula needs is missing or stale.
    OracleMissing { canonical: String },
    /// Route is structurally unusable (empty, inconsistent amounts).
    MalformedRoute,
}

const WEI_PER_ETHER: i128 = 1_000_000_000_000_000_000;
const BPS_DENOMINATOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

pub struct ProfitEngine {
    registry: Arc<Registry>,
    min_profit_usd: Decimal,
    slippage_bps: u32,
}

impl ProfitEngine {
    pub fn new(registry: Arc<Registry>, min_profit_usd: Decimal, slippage_bps: u32) -> Self {
        Self {
            registry,
            min_profit_usd,
            slippage_bps,
        }
    }

    fn usd(&self, prices: &PriceSet, canonical: &str) -> Result<Decimal, ProfitRejection> {
        prices
            .get(canonical)
            .map(|p| p.price)
            .ok_or_else(|| ProfitRejection::OracleMissing { canonical: canonical.to_string() })
    }

    fn canonical_of(&self, route: &Route, token: alloy::primitives::Address) -> Option<String> {
        self.registry
            .token(route.chain, token)
            .map(|t| t.canonical.clone())
    }

    /// Evaluate a candidate route into an opportunity, or reject it.
    pub fn evaluate(
        &self,
        route: Route,
        provider: &FlashProvider,
        gas_units: u64,
        gas_price_wei: u128,
        prices: &PriceSet,
        confidence: Confidence,
    ) -> Result<Opportunity, ProfitRejection> {
        if route.hops.is_empty() || !route.amounts_consistent() {
            return Err(ProfitRejection::MalformedRoute);
        }

        let token_in_canonical = self
            .canonical_of(&route, route.token_in)
            .ok_or(ProfitRejection::MalformedRoute)?;
        let token_out_canonical = match route.hops.last() {
            Some(Hop::Swap(q)) => self
                .canonical_of(&route, q.token_out)
                .or_else(|| {
                    // Cross-chain tails end on another chain; resolve there.
                    self.registry
                        .token(q.chain, q.token_out)
                        .map(|t| t.canonical.clone())
                })
                .ok_or(ProfitRejection::MalformedRoute)?,
            Some(Hop::Bridge(b)) => b.canonical.clone(),
            None => return Err(ProfitRejection::MalformedRoute),
        };

        let native_canonical = self
            .registry
            .chain(route.chain)
            .map(|c| c.native_canonical.clone())
            .ok_or(ProfitRejection::MalformedRoute)?;

        let usd_in = self.usd(prices, &token_in_canonical)?;
        let usd_out = self.usd(prices, &token_out_canonical)?;
        let usd_native = self.usd(prices, &native_canonical)?;

        let input_amount = route.input_amount();
        let gross_out = route.final_amount_out() * usd_out;
        let loan_cost = input_amount * usd_in;

        let flash_fee = loan_cost * Decimal::from(provider.fee_bps) / BPS_DENOMINATOR;

        let gas_wei = Decimal::from(gas_units) * Decimal::from_i128_with_scale(gas_price_wei as i128, 0);
        let gas_cost = gas_wei / Decimal::from_i128_with_scale(WEI_PER_ETHER, 0) * usd_native;

        let mut bridge_fee = Decimal::ZERO;
        for hop in &route.hops {
            if let Hop::Bridge(b) = hop {
                bridge_fee += b.fee * self.usd(prices, &b.canonical)?;
            }
        }

        let slippage_reserve = gross_out * Decimal::from(self.slippage_bps) / BPS_DENOMINATOR;

        // Derived by subtraction: the breakdown reconciles exactly.
        let net_profit = gross_out - loan_cost - flash_fee - gas_cost - bridge_fee - slippage_reserve;

        if net_profit < self.min_profit_usd {
            return Err(ProfitRejection::BelowMinProfit { net: net_profit });
        }
        if net_profit < Decimal::TWO * gas_cost {
            return Err(ProfitRejection::BelowGasFloor { net: net_profit, gas: gas_cost });
        }

        Ok(Opportunity {
            input_amount,
            gross_out_usd: gross_out,
            loan_cost_usd: loan_cost,
            gross_spread_usd: gross_out - loan_cost,
            fees: FeeBreakdown {
                flash_loan_fee: flash_fee,
                gas_cost,
                bridge_fee,
                slippage_reserve,
            },
            net_profit_usd: net_profit,
            gas_cost_usd: gas_cost,
            estimated_gas_units: gas_units,
            confidence,
            route,
        })
    }
}

/// Resolve overlapping-pool conflicts: higher net/gas ratio wins, lower gas
/// breaks ties. Survivors come back in non-increasing net profit, the order
/// they are emitted within a tick.
pub fn select_and_order(mut candidates: Vec<Opportunity>) -> Vec<Opportunity> {
    candidates.sort_by(|a, b| b.ranking().partial_cmp(&a.ranking()).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_pools: HashSet<(u64, alloy::primitives::Address)> = HashSet::new();
    let mut selected = Vec::new();
    for candidate in candidates {
        let pools: Vec<_> = candidate
            .route
            .hops
            .iter()
            .filter_map(|h| match h {
                Hop::Swap(q) => Some((q.chain, q.pool)),
                Hop::Bridge(_) => None,
            })
            .collect();
        if pools.iter().any(|p| used_pools.contains(p)) {
            continue;
        }
        used_pools.extend(pools);
        selected.push(candidate);
    }

    selected.sort_by(|a, b| b.net_profit_usd.cmp(&a.net_profit_usd));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;
    use rust_decimal_macros::dec;

    fn engine() -> ProfitEngine {
        ProfitEngine::new(fixtures::registry(), dec!(5), 0)
    }

    fn provider_free() -> FlashProvider {
        FlashProvider {
            id: "balancer-v2".into(),
            chain: 1,
            vault: fixtures::addr(0xF2),
            fee_bps: 0,
            rank: 2,
        }
    }

    fn provider_paid() -> FlashProvider {
        FlashProvider {
            id: "aave-v3".into(),
            chain: 1,
            vault: fixtures::addr(0xF1),
            fee_bps: 5,
            rank: 1,
        }
    }

    #[test]
    fn breakdown_reconciles_exactly() {
        let engine = ProfitEngine::new(fixtures::registry(), dec!(5), 10);
        let route = fixtures::cycle_route(dec!(1000), dec!(1025), 100);
        let opp = engine
            .evaluate(route, &provider_paid(), 400_000, 3_000_000_000, &fixtures::prices(), Confidence::High)
            .unwrap();

        // gross - loan - flash - gas - bridge - slippage == net, no slack.
        let lhs = opp.gross_out_usd
            - opp.loan_cost_usd
            - opp.fees.flash_loan_fee
            - opp.fees.gas_cost
            - opp.fees.bridge_fee
            - opp.fees.slippage_reserve;
        assert_eq!(lhs, opp.net_profit_usd);

        // Equivalent identity: fee sum == gross - net - loan.
        assert_eq!(
            opp.fees.total(),
            opp.gross_out_usd - opp.net_profit_usd - opp.loan_cost_usd
        );
    }

    #[test]
    fn zero_bps_provider_charges_exactly_zero() {
        let route = fixtures::cycle_route(dec!(1000), dec!(1025), 100);
        let opp = engine()
            .evaluate(route, &provider_free(), 400_000, 3_000_000_000, &fixtures::prices(), Confidence::High)
            .unwrap();
        assert_eq!(opp.fees.flash_loan_fee, Decimal::ZERO);
    }

    #[test]
    fn gas_floor_rejects_thin_spreads() {
        // Net would be ~$12 but gas at $7 makes 2x floor $14.
        let route = fixtures::cycle_route(dec!(1000), dec!(1012), 100);
        // 400k gas at 7000 gwei/2500usd: pick gas price so gas_cost ~= 7 USD:
        // gas_wei = 400000 * 7e9 = 2.8e15 wei = 0.0028 ETH * 2500 = 7 USD.
        let err = engine()
            .evaluate(route, &provider_free(), 400_000, 7_000_000_000, &fixtures::prices(), Confidence::High)
            .unwrap_err();
        assert!(matches!(err, ProfitRejection::BelowGasFloor { .. }));
    }

    #[test]
    fn min_profit_rejects_dust() {
        let route = fixtures::cycle_route(dec!(1000), dec!(1004), 100);
        let err = engine()
            .evaluate(route, &provider_free(), 100_000, 1_000_000_000, &fixtures::prices(), Confidence::High)
            .unwrap_err();
        assert!(matches!(err, ProfitRejection::BelowMinProfit { .. }));
    }

    #[test]
    fn missing_oracle_price_rejects() {
        let route = fixtures::cycle_route(dec!(1000), dec!(1025), 100);
        let empty = PriceSet::new();
        let err = engine()
            .evaluate(route, &provider_free(), 400_000, 3_000_000_000, &empty, Confidence::High)
            .unwrap_err();
        assert!(matches!(err, ProfitRejection::OracleMissing { .. }));
    }

    #[test]
    fn accepted_opportunity_meets_both_floors() {
        let route = fixtures::cycle_route(dec!(1000), dec!(1025), 100);
        let opp = engine()
            .evaluate(route, &provider_free(), 400_000, 3_000_000_000, &fixtures::prices(), Confidence::High)
            .unwrap();
        assert!(opp.net_profit_usd >= dec!(5));
        assert!(opp.net_profit_usd >= Decimal::TWO * opp.gas_cost_usd);
    }

    #[test]
    fn overlapping_pools_resolved_by_net_per_gas() {
        let better = fixtures::opportunity(dec!(20), dec!(4));
        let worse = fixtures::opportunity(dec!(20), dec!(8));
        let survivors = select_and_order(vec![worse, better.clone()]);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].gas_cost_usd, better.gas_cost_usd);
    }

    #[test]
    fn emission_order_is_non_increasing_net_profit() {
        let mut a = fixtures::opportunity(dec!(10), dec!(2));
        let mut b = fixtures::opportunity(dec!(30), dec!(2));
        // Distinct pools so both survive selection.
        if let Hop::Swap(q) = &mut a.route.hops[0] {
            q.pool = fixtures::addr(0x71);
        }
        if let Hop::Swap(q) = &mut a.route.hops[1] {
            q.pool = fixtures::addr(0x72);
        }
        if let Hop::Swap(q) = &mut b.route.hops[0] {
            q.pool = fixtures::addr(0x73);
        }
        if let Hop::Swap(q) = &mut b.route.hops[1] {
            q.pool = fixtures::addr(0x74);
        }
        let survivors = select_and_order(vec![a, b]);
        assert_eq!(survivors.len(), 2);
        assert!(survivors[0].net_profit_usd >= survivors[1].net_profit_usd);
    }
}
