//! Weighted-pool pricing (Balancer formula)
//!
//! out = B_out * (1 - (B_in / (B_in + in*(1-fee)))^(w_in/w_out))

use rust_decimal::{Decimal, MathematicalOps};

use crate::errors::QuoteReason;

/// Output amount for a weighted-product swap.
pub fn amount_out(
    balance_in: Decimal,
    weight_in: Decimal,
    balance_out: Decimal,
    weight_out: Decimal,
    amount_in: Decimal,
    fee: Decimal,
) -> Result<(Decimal, Decimal), QuoteReason> {
    if balance_in <= Decimal::ZERO || balance_out <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }
    if weight_in <= Decimal::ZERO || weight_out <= Decimal::ZERO {
        return Err(QuoteReason::TokenMismatch);
    }
    if amount_in <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    let amount_after_fee = amount_in * (Decimal::ONE - fee);
    let base = balance_in / (balance_in + amount_after_fee);
    let exponent = weight_in / weight_out;
    let ratio = base
        .checked_powd(exponent)
        .ok_or(QuoteReason::NumericOverflow)?;

    let out = balance_out * (Decimal::ONE - ratio);
    if out >= balance_out {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    let depth_used = amount_in / balance_in;
    Ok((out, depth_used))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn equal_weights_match_constant_product() {
        // 50/50 weighted pool degenerates to x*y=k.
        let (weighted, _) = amount_out(
            dec!(1000000),
            dec!(0.5),
            dec!(1000000),
            dec!(0.5),
            dec!(100),
            Decimal::ZERO,
        )
        .unwrap();
        let constant_product = dec!(100) * dec!(1000000) / dec!(1000100);
        assert!((weighted - constant_product).abs() < dec!(0.5), "weighted = {weighted}");
    }

    #[test]
    fn eighty_twenty_pool_prices_spot_correctly() {
        // Spot price for out-per-in = (B_out/w_out)/(B_in/w_in). For an
        // 80/20 WETH/USDC pool with 800 WETH and 500k USDC selling USDC:
        // spot = (800/0.8)/(500000/0.2) = 1000/2500000 = 0.0004 WETH per USDC.
        let (out, _) = amount_out(
            dec!(500000),
            dec!(0.2),
            dec!(800),
            dec!(0.8),
            dec!(100),
            Decimal::ZERO,
        )
        .unwrap();
        let spot = dec!(100) * dec!(0.0004);
        assert!(out < spot && out > spot * dec!(0.999), "out = {out}");
    }

    #[test]
    fn zero_fee_tier_charges_exactly_nothing() {
        let (no_fee, _) = amount_out(
            dec!(1000000),
            dec!(0.5),
            dec!(1000000),
            dec!(0.5),
            dec!(1000),
            Decimal::ZERO,
        )
        .unwrap();
        let (with_fee, _) = amount_out(
            dec!(1000000),
            dec!(0.5),
            dec!(1000000),
            dec!(0.5),
            dec!(1000),
            dec!(0.003),
        )
        .unwrap();
        assert!(no_fee > with_fee);
        // Zero-fee path must be the pure invariant, not fee=epsilon.
        let pure = dec!(1000) * dec!(1000000) / dec!(1001000);
        assert!((no_fee - pure).abs() < dec!(0.5));
    }

    #[test]
    fn empty_side_rejected() {
        assert!(amount_out(
            Decimal::ZERO,
            dec!(0.5),
            dec!(1000),
            dec!(0.5),
            dec!(10),
            Decimal::ZERO
        )
        .is_err());
    }
}
