//! Core domain types shared across the pipeline
//!
//! Quotes, routes, opportunities and signals. All monetary values are
//! `rust_decimal::Decimal` in human units; raw integer token units appear
//! only at the chain boundary (state ingestion and tx encoding).

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::EngineError;

/// EVM chain identifier (the on-chain `chainId`).
pub type ChainId = u64;

/// Wire version of the signal envelope. Consumers reject anything else.
pub const SIGNAL_VERSION: u32 = 1;

/// How a transaction reaches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MevPolicy {
    /// Private relay when available, public mempool for small trades otherwise.
    Private,
    /// Always allowed to fall through to the public mempool.
    AllowPublic,
    /// Private relay or nothing.
    PrivateOrReject,
}

impl std::fmt::Display for MevPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MevPolicy::Private => write!(f, "PRIVATE"),
            MevPolicy::AllowPublic => write!(f, "ALLOW_PUBLIC"),
            MevPolicy::PrivateOrReject => write!(f, "PRIVATE_OR_REJECT"),
        }
    }
}

/// Output of a single swap hop against one pool at one block.
///
/// Valid only as of `source_block`; the scanner drops quotes that fall
/// outside the freshness window before a signal is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub chain: ChainId,
    pub pool: Address,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    /// amount_out / amount_in.
    pub effective_price: Decimal,
    /// Fraction of the pool's usable depth consumed by this quote (0..1).
    pub depth_used: Decimal,
    pub source_block: u64,
    pub observed_at: DateTime<Utc>,
}

/// A cross-chain transfer hop with an explicit fee quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeQuote {
    pub provider: String,
    pub chain_from: ChainId,
    pub chain_to: ChainId,
    /// Canonical id of the token being bridged.
    pub canonical: String,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub fee: Decimal,
}

/// One hop of a route: a swap against a pool or a bridge transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Hop {
    Swap(Quote),
    Bridge(BridgeQuote),
}

impl Hop {
    pub fn amount_in(&self) -> Decimal {
        match self {
            Hop::Swap(q) => q.amount_in,
            Hop::Bridge(b) => b.amount_in,
        }
    }

    pub fn amount_out(&self) -> Decimal {
        match self {
            Hop::Swap(q) => q.amount_out,
            Hop::Bridge(b) => b.amount_out,
        }
    }
}

/// Ordered sequence of hops forming a closed cycle (same canonical token at
/// both ends), bound to one source block per chain touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub hops: Vec<Hop>,
    /// Chain the route starts (and is funded) on.
    pub chain: ChainId,
    /// Token borrowed via flash loan; the route must return to it.
    pub token_in: Address,
    pub source_blocks: BTreeMap<ChainId, u64>,
}

impl Route {
    pub fn input_amount(&self) -> Decimal {
        self.hops.first().map(Hop::amount_in).unwrap_or_default()
    }

    pub fn final_amount_out(&self) -> Decimal {
        self.hops.last().map(Hop::amount_out).unwrap_or_default()
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn is_cross_chain(&self) -> bool {
        self.hops.iter().any(|h| matches!(h, Hop::Bridge(_)))
    }

    /// Amounts must chain: each hop's input equals the previous hop's output.
    pub fn amounts_consistent(&self) -> bool {
        self.hops
            .windows(2)
            .all(|w| w[0].amount_out() == w[1].amount_in())
    }
}

/// Confidence attached to an opportunity's evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// All quotes from head-block state.
    High,
    /// Some quote state one block behind head.
    Medium,
    /// Evaluation used any fallback (e.g. default gas estimate).
    Low,
}

/// USD cost components of an opportunity.
///
/// The breakdown reconciles exactly:
/// `gross_out - loan_cost - flash_loan_fee - gas_cost - bridge_fee - slippage_reserve == net_profit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub flash_loan_fee: Decimal,
    pub gas_cost: Decimal,
    pub bridge_fee: Decimal,
    pub slippage_reserve: Decimal,
}

impl FeeBreakdown {
    pub fn total(&self) -> Decimal {
        self.flash_loan_fee + self.gas_cost + self.bridge_fee + self.slippage_reserve
    }
}

/// A profitable route plus its economic evaluation. Exists only long enough
/// to become a signal or be dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub route: Route,
    pub input_amount: Decimal,
    /// USD value of the final hop's output.
    pub gross_out_usd: Decimal,
    /// USD value borrowed (input amount at the oracle rate).
    pub loan_cost_usd: Decimal,
    /// gross_out_usd - loan_cost_usd, before fees.
    pub gross_spread_usd: Decimal,
    pub fees: FeeBreakdown,
    pub net_profit_usd: Decimal,
    pub gas_cost_usd: Decimal,
    pub estimated_gas_units: u64,
    pub confidence: Confidence,
}

impl Opportunity {
    /// Tie-break key for opportunities targeting overlapping pools:
    /// higher net/gas ratio wins; on equality, lower gas wins.
    pub fn ranking(&self) -> (Decimal, Decimal) {
        let ratio = if self.gas_cost_usd.is_zero() {
            Decimal::MAX
        } else {
            self.net_profit_usd / self.gas_cost_usd
        };
        (ratio, -self.gas_cost_usd)
    }
}

/// A serialized opportunity prepared for dispatch. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub version: u32,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub flash_loan_provider: String,
    pub mev_policy: MevPolicy,
    pub opportunity: Opportunity,
}

impl Signal {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::SignalDecode(e.to_string()))
    }

    /// Parse and validate the envelope version. Consumers MUST reject
    /// versions they do not speak, regardless of payload shape.
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        #[derive(Deserialize)]
        struct VersionProbe {
            version: u32,
        }
        let probe: VersionProbe =
            serde_json::from_str(raw).map_err(|e| EngineError::SignalDecode(e.to_string()))?;
        if probe.version != SIGNAL_VERSION {
            return Err(EngineError::UnsupportedVersion(probe.version));
        }
        serde_json::from_str(raw).map_err(|e| EngineError::SignalDecode(e.to_string()))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Current per-chain gas market data, integers in wei at the chain boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    pub base_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub gas_price: u128,
}

impl FeeData {
    pub fn base_fee_gwei(&self) -> u64 {
        (self.base_fee_per_gas / 1_000_000_000) as u64
    }
}
