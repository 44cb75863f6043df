//! MEV submission routing
//!
//! Decides where a signed transaction goes: the chain's private relay or
//! the public mempool. The relay-unreachable policy is an explicit setting,
//! never an implicit default.

use rust_decimal::Decimal;

use crate::errors::RejectReason;
use crate::types::MevPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionRoute {
    PrivateRelay,
    PublicMempool,
}

/// Pick the submission route for one trade.
///
/// - `PRIVATE`: relay when healthy; small trades may fall through to the
///   public mempool, high-value trades are rejected instead.
/// - `ALLOW_PUBLIC`: relay when healthy, public otherwise, regardless of
///   trade size.
/// - `PRIVATE_OR_REJECT`: relay or nothing.
pub fn route_submission(
    policy: MevPolicy,
    trade_value_usd: Decimal,
    high_value_usd: Decimal,
    relay_healthy: bool,
) -> Result<SubmissionRoute, RejectReason> {
    match policy {
        MevPolicy::PrivateOrReject => {
            if relay_healthy {
                Ok(SubmissionRoute::PrivateRelay)
            } else {
                Err(RejectReason::MevProtectionRequired)
            }
        }
        MevPolicy::Private => {
            if relay_healthy {
                Ok(SubmissionRoute::PrivateRelay)
            } else if trade_value_usd >= high_value_usd {
                Err(RejectReason::MevProtectionRequired)
            } else {
                Ok(SubmissionRoute::PublicMempool)
            }
        }
        MevPolicy::AllowPublic => {
            if relay_healthy {
                Ok(SubmissionRoute::PrivateRelay)
            } else {
                Ok(SubmissionRoute::PublicMempool)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn private_prefers_relay() {
        let route = route_submission(MevPolicy::Private, dec!(1000), dec!(50000), true).unwrap();
        assert_eq!(route, SubmissionRoute::PrivateRelay);
    }

    #[test]
    fn private_high_value_without_relay_rejects() {
        let err =
            route_submission(MevPolicy::Private, dec!(60000), dec!(50000), false).unwrap_err();
        assert_eq!(err, RejectReason::MevProtectionRequired);
    }

    #[test]
    fn private_small_trade_falls_through() {
        let route = route_submission(MevPolicy::Private, dec!(1000), dec!(50000), false).unwrap();
        assert_eq!(route, SubmissionRoute::PublicMempool);
    }

    #[test]
    fn private_or_reject_never_goes_public() {
        assert!(route_submission(MevPolicy::PrivateOrReject, dec!(1), dec!(50000), false).is_err());
        assert_eq!(
            route_submission(MevPolicy::PrivateOrReject, dec!(1), dec!(50000), true).unwrap(),
            SubmissionRoute::PrivateRelay
        );
    }

    #[test]
    fn allow_public_always_submits() {
        assert_eq!(
            route_submission(MevPolicy::AllowPublic, dec!(90000), dec!(50000), false).unwrap(),
            SubmissionRoute::PublicMempool
        );
    }
}
