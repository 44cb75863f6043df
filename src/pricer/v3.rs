//! Concentrated-liquidity pricing (V3 sqrt-price math)
//!
//! Swap-within-active-range model: amounts move the sqrt price against the
//! in-range liquidity L. A trade that would consume more than
//! `MAX_RANGE_SHARE` of the range's virtual reserves is refused instead of
//! crossing ticks; the scanner works with sizes far below that.
//!
//! All inputs here are RAW token units as decimals (the sqrt price relates
//! raw amounts); the pricer converts from human units at the call boundary.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::errors::QuoteReason;

/// Share of the active range's virtual reserves a single quote may consume.
const MAX_RANGE_SHARE: Decimal = dec!(0.5);

/// Output amount for a swap against in-range liquidity.
///
/// `sqrt_price` is sqrt(token1_raw / token0_raw); `zero_for_one` means
/// token0 in, token1 out. Fee is a fraction (0.0005 for the 500 tier).
pub fn amount_out(
    sqrt_price: Decimal,
    liquidity: Decimal,
    zero_for_one: bool,
    amount_in_raw: Decimal,
    fee: Decimal,
) -> Result<(Decimal, Decimal), QuoteReason> {
    if sqrt_price <= Decimal::ZERO || liquidity <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }
    if amount_in_raw <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    let amount_after_fee = amount_in_raw * (Decimal::ONE - fee);

    let (out, virtual_out_reserve) = if zero_for_one {
        // Selling token0 pushes the price down:
        //   sp' = L*sp / (L + dx*sp),  dy = L*(sp - sp')
        let denominator = liquidity
            .checked_add(
                amount_after_fee
                    .checked_mul(sqrt_price)
                    .ok_or(QuoteReason::NumericOverflow)?,
            )
            .ok_or(QuoteReason::NumericOverflow)?;
        let new_sqrt_price = liquidity
            .checked_mul(sqrt_price)
            .ok_or(QuoteReason::NumericOverflow)?
            / denominator;
        let out = liquidity
            .checked_mul(sqrt_price - new_sqrt_price)
            .ok_or(QuoteReason::NumericOverflow)?;
        let reserve1 = liquidity
            .checked_mul(sqrt_price)
            .ok_or(QuoteReason::NumericOverflow)?;
        (out, reserve1)
    } else {
        // Selling token1 pushes the price up:
        //   sp' = sp + dy/L,  dx = L*(1/sp - 1/sp')
        let new_sqrt_price = sqrt_price + amount_after_fee / liquidity;
        let out = liquidity
            .checked_mul(Decimal::ONE / sqrt_price - Decimal::ONE / new_sqrt_price)
            .ok_or(QuoteReason::NumericOverflow)?;
        let reserve0 = liquidity / sqrt_price;
        (out, reserve0)
    };

    if virtual_out_reserve <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }
    let depth_used = out / virtual_out_reserve;
    if depth_used > MAX_RANGE_SHARE {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    Ok((out, depth_used))
}
