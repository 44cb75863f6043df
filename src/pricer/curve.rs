//! Stable-swap pricing (Curve invariant)
//!
//! Newton iteration for the invariant D and the post-trade balance y,
//! bounded at 64 rounds with 1e-12 convergence. Balances are human units;
//! the invariant is scale-free as long as every balance shares the unit.

use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;

use crate::errors::QuoteReason;

const MAX_ITERATIONS: usize = 64;
const CONVERGENCE: Decimal = dec!(0.000000000001);

/// Solve the stable-swap invariant D for the given balances.
fn invariant_d(balances: &[Decimal], amp: Decimal) -> Result<Decimal, QuoteReason> {
    let n = Decimal::from(balances.len());
    let sum: Decimal = balances.iter().copied().sum();
    if sum.is_zero() {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    let ann = amp * n.powi(balances.len() as i64);
    let mut d = sum;
    for _ in 0..MAX_ITERATIONS {
        let mut d_p = d;
        for balance in balances {
            if balance.is_zero() {
                return Err(QuoteReason::InsufficientLiquidity);
            }
            d_p = d_p.checked_mul(d).ok_or(QuoteReason::NumericOverflow)? / (*balance * n);
        }
        let d_next = (ann * sum + n * d_p)
            .checked_mul(d)
            .ok_or(QuoteReason::NumericOverflow)?
            / ((ann - Decimal::ONE) * d + (n + Decimal::ONE) * d_p);
        if (d_next - d).abs() < CONVERGENCE {
            return Ok(d_next);
        }
        d = d_next;
    }
    Ok(d)
}

/// Solve for the output-side balance y given the new input-side balance.
fn solve_y(
    balances: &[Decimal],
    amp: Decimal,
    index_in: usize,
    index_out: usize,
    new_balance_in: Decimal,
    d: Decimal,
) -> Result<Decimal, QuoteReason> {
    let n = Decimal::from(balances.len());
    let ann = amp * n.powi(balances.len() as i64);

    let mut c = d;
    let mut sum = Decimal::ZERO;
    for (k, balance) in balances.iter().enumerate() {
        if k == index_out {
            continue;
        }
        let x = if k == index_in { new_balance_in } else { *balance };
        if x.is_zero() {
            return Err(QuoteReason::InsufficientLiquidity);
        }
        sum += x;
        c = c.checked_mul(d).ok_or(QuoteReason::NumericOverflow)? / (x * n);
    }
    c = c.checked_mul(d).ok_or(QuoteReason::NumericOverflow)? / (ann * n);
    let b = sum + d / ann;

    let mut y = d;
    for _ in 0..MAX_ITERATIONS {
        let y_next = (y.checked_mul(y).ok_or(QuoteReason::NumericOverflow)? + c)
            / (dec!(2) * y + b - d);
        if (y_next - y).abs() < CONVERGENCE {
            return Ok(y_next);
        }
        y = y_next;
    }
    Ok(y)
}

/// Output amount for a stable swap from `index_in` to `index_out`.
pub fn amount_out(
    balances: &[Decimal],
    amplification: u64,
    index_in: usize,
    index_out: usize,
    amount_in: Decimal,
    fee: Decimal,
) -> Result<(Decimal, Decimal), QuoteReason> {
    if index_in == index_out || index_in >= balances.len() || index_out >= balances.len() {
        return Err(QuoteReason::TokenMismatch);
    }
    if amount_in <= Decimal::ZERO {
        return Err(QuoteReason::InsufficientLiquidity);
    }

    let amp = Decimal::from(amplification);
    let d = invariant_d(balances, amp)?;
    let new_balance_in = balances[index_in] + amount_in;
    let y = solve_y(balances, amp, index_in, index_out, new_balance_in, d)?;

    let gross_out = balances[index_out] - y;
    if gross_out <= Decimal::ZERO || gross_out >= balances[index_out] {
        return Err(QuoteReason::InsufficientLiquidity);
    }
    let out = gross_out * (Decimal::ONE - fee);
    let depth_used = amount_in / balances[index_in];
    Ok((out, depth_used))
}
