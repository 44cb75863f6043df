//! Engine error taxonomy
//!
//! One variant per failure kind. Infrastructure errors are retried at their
//! nearest layer (endpoint failover, one-shot nonce refresh); business errors
//! (unprofitable, expired) are never retried.

use std::time::Duration;

use crate::types::ChainId;

/// All failure kinds surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Fatal at startup, nonzero exit.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Every RPC endpoint for a chain is unhealthy.
    #[error("all rpc endpoints down for chain {chain}")]
    AllEndpointsDown { chain: ChainId },

    /// A single route evaluation could not be priced. Route dropped, tick continues.
    #[error("quote unavailable: {0}")]
    QuoteUnavailable(QuoteReason),

    /// USD price for a token is missing or past its max age.
    #[error("oracle price stale for {token}")]
    OracleStale { token: String },

    /// The signal bus cannot accept or deliver signals.
    #[error("signal bus unavailable: {0}")]
    BusUnavailable(String),

    /// Dry-run of the assembled transaction reverted. Terminal for the signal.
    #[error("simulation reverted: {0}")]
    SimulationReverted(String),

    /// The node refused the raw transaction. Terminal for the signal.
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    /// The transaction was included but reverted on-chain.
    #[error("transaction reverted on-chain: {0}")]
    Reverted(String),

    /// Signal deadline passed before processing.
    #[error("signal expired")]
    Expired,

    /// The node reports a different pending nonce than the manager expected.
    #[error("nonce conflict on chain {chain}: local {local}, node {node}")]
    NonceConflict {
        chain: ChainId,
        local: u64,
        node: u64,
    },

    /// An outbound call exceeded its deadline. Treated as an endpoint failure.
    #[error("rpc timeout after {0:?}")]
    Timeout(Duration),

    /// Single endpoint RPC failure (transport or node error).
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Signal envelope version this consumer does not speak.
    #[error("unsupported signal version {0}")]
    UnsupportedVersion(u32),

    /// Malformed signal payload on the bus.
    #[error("signal decode failed: {0}")]
    SignalDecode(String),

    /// Registry lookup miss or inconsistency discovered after boot.
    #[error("registry: {0}")]
    Registry(String),
}

/// Why a single quote could not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteReason {
    /// Pool state could not be fetched within the tick budget.
    StateUnavailable,
    /// Cached state fell outside the freshness window.
    StaleState { pool_block: u64, head: u64 },
    /// The requested size exhausts the pool's usable depth.
    InsufficientLiquidity,
    /// Intermediate value exceeded decimal range.
    NumericOverflow,
    /// Token not part of this pool.
    TokenMismatch,
}

impl std::fmt::Display for QuoteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuoteReason::StateUnavailable => write!(f, "pool state unavailable"),
            QuoteReason::StaleState { pool_block, head } => {
                write!(f, "pool state at block {pool_block} too far behind head {head}")
            }
            QuoteReason::InsufficientLiquidity => write!(f, "insufficient liquidity"),
            QuoteReason::NumericOverflow => write!(f, "numeric overflow"),
            QuoteReason::TokenMismatch => write!(f, "token not in pool"),
        }
    }
}

/// Reasons a signal terminates in `REJECTED` (or a failed terminal state).
///
/// `counts_toward_breaker` separates infrastructure failures (which trip the
/// circuit breaker) from business rejections (which never do).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateSignal,
    FlashLoanDisabled,
    UnknownProvider(String),
    SelfFundedRoute,
    TooManyHops { hops: usize, max: usize },
    UnknownToken(String),
    SignalExpired,
    ChainUnavailable(ChainId),
    NetProfitBelowMinimum,
    NetProfitBelowGasFloor,
    GasPriceAboveCeiling { base_fee_gwei: u64, max_gwei: u64 },
    SimulationProfitShortfall,
    SimulationReverted(String),
    SubmissionRejected(String),
    RevertedOnChain(String),
    MevProtectionRequired,
    NonceConflict,
    OracleMissing(String),
    UnsupportedVersion(u32),
}

impl RejectReason {
    /// Infrastructure failures count toward the circuit breaker; business
    /// rejections and expiry never do.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            RejectReason::ChainUnavailable(_)
                | RejectReason::SimulationReverted(_)
                | RejectReason::SubmissionRejected(_)
                | RejectReason::RevertedOnChain(_)
                | RejectReason::NonceConflict
        )
    }

    /// Stable tag for structured log events.
    pub fn tag(&self) -> &'static str {
        match self {
            RejectReason::DuplicateSignal => "DuplicateSignal",
            RejectReason::FlashLoanDisabled => "FlashLoanDisabled",
            RejectReason::UnknownProvider(_) => "UnknownProvider",
            RejectReason::SelfFundedRoute => "SelfFundedRoute",
            RejectReason::TooManyHops { .. } => "TooManyHops",
            RejectReason::UnknownToken(_) => "UnknownToken",
            RejectReason::SignalExpired => "SignalExpired",
            RejectReason::ChainUnavailable(_) => "ChainUnavailable",
            RejectReason::NetProfitBelowMinimum => "NetProfitBelowMinimum",
            RejectReason::NetProfitBelowGasFloor => "NetProfitBelowGasFloor",
            RejectReason::GasPriceAboveCeiling { .. } => "GasPriceAboveCeiling",
            RejectReason::SimulationProfitShortfall => "SimulationProfitShortfall",
            RejectReason::SimulationReverted(_) => "SimulationReverted",
            RejectReason::SubmissionRejected(_) => "SubmissionRejected",
            RejectReason::RevertedOnChain(_) => "Reverted",
            RejectReason::MevProtectionRequired => "MEVProtectionRequired",
            RejectReason::NonceConflict => "NonceConflict",
            RejectReason::OracleMissing(_) => "OracleStale",
            RejectReason::UnsupportedVersion(_) => "UnsupportedVersion",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::DuplicateSignal => write!(f, "duplicate signal id"),
            RejectReason::FlashLoanDisabled => write!(f, "flash loans disabled by configuration"),
            RejectReason::UnknownProvider(id) => write!(f, "flash loan provider '{id}' not in registry"),
            RejectReason::SelfFundedRoute => write!(f, "route is not flash-loan funded"),
            RejectReason::TooManyHops { hops, max } => write!(f, "route has {hops} hops, max {max}"),
            RejectReason::UnknownToken(t) => write!(f, "token {t} not in registry"),
            RejectReason::SignalExpired => write!(f, "signal past expires_at"),
            RejectReason::ChainUnavailable(c) => write!(f, "chain {c} unavailable"),
            RejectReason::NetProfitBelowMinimum => write!(f, "net profit below configured minimum"),
            RejectReason::NetProfitBelowGasFloor => write!(f, "net profit below 2x gas cost"),
            RejectReason::GasPriceAboveCeiling { base_fee_gwei, max_gwei } => {
                write!(f, "base fee {base_fee_gwei} gwei above ceiling {max_gwei} gwei")
            }
            RejectReason::SimulationProfitShortfall => {
                write!(f, "simulated profit below declared profit tolerance")
            }
            RejectReason::SimulationReverted(e) => write!(f, "simulation reverted: {e}"),
            RejectReason::SubmissionRejected(e) => write!(f, "node rejected submission: {e}"),
            RejectReason::RevertedOnChain(e) => write!(f, "reverted on-chain: {e}"),
            RejectReason::MevProtectionRequired => {
                write!(f, "private relay required but unavailable")
            }
            RejectReason::NonceConflict => write!(f, "nonce conflict persisted after refresh"),
            RejectReason::OracleMissing(t) => write!(f, "no fresh USD price for {t}"),
            RejectReason::UnsupportedVersion(v) => write!(f, "unsupported signal version {v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_reasons_count_toward_breaker() {
        assert!(RejectReason::SimulationReverted("boom".into()).counts_toward_breaker());
        assert!(RejectReason::RevertedOnChain("out of gas".into()).counts_toward_breaker());
        assert!(RejectReason::ChainUnavailable(1).counts_toward_breaker());
    }

    #[test]
    fn business_reasons_do_not_count() {
        assert!(!RejectReason::SignalExpired.counts_toward_breaker());
        assert!(!RejectReason::NetProfitBelowGasFloor.counts_toward_breaker());
        assert!(!RejectReason::FlashLoanDisabled.counts_toward_breaker());
        assert!(!RejectReason::DuplicateSignal.counts_toward_breaker());
    }
}
