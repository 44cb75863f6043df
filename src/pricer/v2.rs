//! Constant-product pricing (x*y=k with fee)

use rust_decimal::Decimal;

use crate::errors::QuoteReason;

/// Output amount for a constant-product swap. Amounts and reserves share the
/// same (human) unit scale; the fee is a fraction like 0.003.
pub fn amount_out(
    reserve_in: Decimal,
    reserve_out: Decimal,
    amount_in: Decimal,
    fee: Decimal,
) -> Result<(Decimal, Decimal), QuoteReason> {
    if reserve_in <= Decimal::ZERO || reserve_out <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }
    if amount_in <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    let amount_in_with_fee = amount_in * (Decimal::ONE - fee);
    let numerator = amount_in_with_fee
        .checked_mul(reserve_out)
        .ok_or(QuoteReason::NumericOverflow)?;
    let denominator = reserve_in + amount_in_with_fee;
    let out = numerator / denominator;

    if out >= reserve_out {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    let depth_used = amount_in / reserve_in;
    Ok((out, depth_used))
}
