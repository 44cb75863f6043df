//! Executor route encoding
//!
//! The on-chain executor takes one versioned byte blob: protocol-tagged
//! hops, the flash-loan vault, the borrowed token and amount, and a
//! minimum-out. Layout (big-endian):
//!
//! ```text
//! u8 version | u8 hop_count | hops... | vault(20) | token(20) | amount(32) | min_out(32)
//! swap hop:   tag(1) chain(8) pool(20) token_in(20) token_out(20) aux(4)
//! bridge hop: 0x10   from(8)  to(8)    token(20)    provider_len(1) provider(..)
//! ```
//!
//! Decode is the exact inverse; `decode(encode(plan)) == plan` is a tested
//! law because the engine must be able to audit what it submitted.

use alloy::primitives::{Address, U256};

use crate::errors::EngineError;
use crate::pricer::state::decimal_to_raw;
use crate::registry::{PoolKind, Registry};
use crate::types::{Hop, Signal};
use rust_decimal::Decimal;

pub const ROUTE_ENCODING_VERSION: u8 = 1;

const TAG_V2: u8 = 1;
const TAG_V3: u8 = 2;
const TAG_CURVE: u8 = 3;
const TAG_BALANCER: u8 = 4;
const TAG_BRIDGE: u8 = 0x10;

/// Wire-level route: raw integer amounts, concrete addresses. Built from a
/// signal immediately before tx assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub version: u8,
    pub hops: Vec<PlanHop>,
    pub vault: Address,
    pub token_in: Address,
    pub amount_in: U256,
    pub min_out: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanHop {
    Swap {
        protocol: u8,
        chain: u64,
        pool: Address,
        token_in: Address,
        token_out: Address,
        /// Fee tier (V3) or fee bps (V2/Curve/Balancer), whatever the
        /// protocol tag needs on-chain.
        aux: u32,
    },
    Bridge {
        chain_from: u64,
        chain_to: u64,
        token: Address,
        provider: String,
    },
}

fn protocol_tag(kind: &PoolKind) -> (u8, u32) {
    match kind {
        PoolKind::V2 { fee_bps } => (TAG_V2, *fee_bps),
        PoolKind::V3 { fee_ppm } => (TAG_V3, *fee_ppm),
        PoolKind::Curve { fee_bps, .. } => (TAG_CURVE, *fee_bps),
        PoolKind::Balancer { swap_fee_bps, .. } => (TAG_BALANCER, *swap_fee_bps),
    }
}

impl RoutePlan {
    /// Assemble the wire plan from a signal. Amounts convert from decimals
    /// to raw units here, at the chain boundary, and nowhere earlier.
    pub fn build(
        signal: &Signal,
        registry: &Registry,
        slippage_bps: u32,
    ) -> Result<Self, EngineError> {
        let route = &signal.opportunity.route;
        let provider = registry
            .provider(&signal.flash_loan_provider)
            .ok_or_else(|| {
                EngineError::Registry(format!(
                    "flash provider '{}' unknown",
                    signal.flash_loan_provider
                ))
            })?;

        let token_in = registry
            .token(route.chain, route.token_in)
            .ok_or_else(|| EngineError::Registry(format!("token {} unknown", route.token_in)))?;
        let amount_in = decimal_to_raw(route.input_amount(), token_in.decimals)
            .map_err(|e| EngineError::Registry(format!("amount_in: {e}")))?;

        let mut hops = Vec::with_capacity(route.hops.len());
        let mut last_out: Option<(u64, Address)> = None;
        for hop in &route.hops {
            match hop {
                Hop::Swap(quote) => {
                    let pool = registry
                        .pool(quote.chain, quote.pool)
                        .ok_or_else(|| EngineError::Registry(format!("pool {} unknown", quote.pool)))?;
                    let (protocol, aux) = protocol_tag(&pool.kind);
                    hops.push(PlanHop::Swap {
                        protocol,
                        chain: quote.chain,
                        pool: quote.pool,
                        token_in: quote.token_in,
                        token_out: quote.token_out,
                        aux,
                    });
                    last_out = Some((quote.chain, quote.token_out));
                }
                Hop::Bridge(bridge) => {
                    let token = registry
                        .equivalent_on(&bridge.canonical, bridge.chain_from)
                        .ok_or_else(|| {
                            EngineError::Registry(format!(
                                "no {} token on chain {}",
                                bridge.canonical, bridge.chain_from
                            ))
                        })?;
                    hops.push(PlanHop::Bridge {
                        chain_from: bridge.chain_from,
                        chain_to: bridge.chain_to,
                        token: token.address,
                        provider: bridge.provider.clone(),
                    });
                    let out = registry
                        .equivalent_on(&bridge.canonical, bridge.chain_to)
                        .ok_or_else(|| {
                            EngineError::Registry(format!(
                                "no {} token on chain {}",
                                bridge.canonical, bridge.chain_to
                            ))
                        })?;
                    last_out = Some((bridge.chain_to, out.address));
                }
            }
        }

        let (out_chain, out_token) = last_out
            .ok_or_else(|| EngineError::Registry("route has no hops".into()))?;
        let out_meta = registry
            .token(out_chain, out_token)
            .ok_or_else(|| EngineError::Registry(format!("token {out_token} unknown")))?;
        let min_out_decimal = route.final_amount_out()
            * (Decimal::ONE - Decimal::new(slippage_bps as i64, 4));
        let min_out = decimal_to_raw(min_out_decimal, out_meta.decimals)
            .map_err(|e| EngineError::Registry(format!("min_out: {e}")))?;

        Ok(Self {
            version: ROUTE_ENCODING_VERSION,
            hops,
            vault: provider.vault,
            token_in: route.token_in,
            amount_in,
            min_out,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.hops.len() * 73 + 104);
        out.push(self.version);
        out.push(self.hops.len() as u8);
        for hop in &self.hops {
            match hop {
                PlanHop::Swap {
                    protocol,
                    chain,
                    pool,
                    token_in,
                    token_out,
                    aux,
                } => {
                    out.push(*protocol);
                    out.extend_from_slice(&chain.to_be_bytes());
                    out.extend_from_slice(pool.as_slice());
                    out.extend_from_slice(token_in.as_slice());
                    out.extend_from_slice(token_out.as_slice());
                    out.extend_from_slice(&aux.to_be_bytes());
                }
                PlanHop::Bridge {
                    chain_from,
                    chain_to,
                    token,
                    provider,
                } => {
                    out.push(TAG_BRIDGE);
                    out.extend_from_slice(&chain_from.to_be_bytes());
                    out.extend_from_slice(&chain_to.to_be_bytes());
                    out.extend_from_slice(token.as_slice());
                    out.push(provider.len() as u8);
                    out.extend_from_slice(provider.as_bytes());
                }
            }
        }
        out.extend_from_slice(self.vault.as_slice());
        out.extend_from_slice(self.token_in.as_slice());
        out.extend_from_slice(&self.amount_in.to_be_bytes::<32>());
        out.extend_from_slice(&self.min_out.to_be_bytes::<32>());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut reader = Reader::new(bytes);
        let version = reader.u8()?;
        if version != ROUTE_ENCODING_VERSION {
            return Err(EngineError::UnsupportedVersion(version as u32));
        }
        let hop_count = reader.u8()? as usize;
        let mut hops = Vec::with_capacity(hop_count);
        for _ in 0..hop_count {
            let tag = reader.u8()?;
            match tag {
                TAG_BRIDGE => {
                    let chain_from = reader.u64()?;
                    let chain_to = reader.u64()?;
                    let token = reader.address()?;
                    let len = reader.u8()? as usize;
                    let provider = String::from_utf8(reader.bytes(len)?.to_vec())
                        .map_err(|_| EngineError::SignalDecode("bad provider utf8".into()))?;
                    hops.push(PlanHop::Bridge {
                        chain_from,
                        chain_to,
                        token,
                        provider,
                    });
                }
                TAG_V2 | TAG_V3 | TAG_CURVE | TAG_BALANCER => {
                    hops.push(PlanHop::Swap {
                        protocol: tag,
                        chain: reader.u64()?,
                        pool: reader.address()?,
                        token_in: reader.address()?,
                        token_out: reader.address()?,
                        aux: reader.u32()?,
                    });
                }
                other => {
                    return Err(EngineError::SignalDecode(format!("unknown hop tag {other}")))
                }
            }
        }
        let plan = Self {
            version,
            hops,
            vault: reader.address()?,
            token_in: reader.address()?,
            amount_in: reader.u256()?,
            min_out: reader.u256()?,
        };
        reader.finish()?;
        Ok(plan)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], EngineError> {
        let end = self.at + n;
        if end > self.bytes.len() {
            return Err(EngineError::SignalDecode("route bytes truncated".into()));
        }
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EngineError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, EngineError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, EngineError> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().expect("8 bytes")))
    }

    fn address(&mut self) -> Result<Address, EngineError> {
        Ok(Address::from_slice(self.bytes(20)?))
    }

    fn u256(&mut self) -> Result<U256, EngineError> {
        Ok(U256::from_be_slice(self.bytes(32)?))
    }

    fn finish(&self) -> Result<(), EngineError> {
        if self.at != self.bytes.len() {
            return Err(EngineError::SignalDecode("trailing route bytes".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_plan() -> RoutePlan {
        RoutePlan {
            version: ROUTE_ENCODING_VERSION,
            hops: vec![
                PlanHop::Swap {
                    protocol: TAG_V2,
                    chain: 1,
                    pool: fixtures::addr(0xC1),
                    token_in: fixtures::usdc(),
                    token_out: fixtures::weth(),
                    aux: 30,
                },
                PlanHop::Bridge {
                    chain_from: 1,
                    chain_to: 137,
                    token: fixtures::usdc(),
                    provider: "hop".into(),
                },
                PlanHop::Swap {
                    protocol: TAG_V3,
                    chain: 137,
                    pool: fixtures::addr(0xD1),
                    token_in: fixtures::usdc_poly(),
                    token_out: fixtures::wmatic(),
                    aux: 500,
                },
            ],
            vault: fixtures::addr(0xF2),
            token_in: fixtures::usdc(),
            amount_in: U256::from(1_000_000_000u64),
            min_out: U256::from(998_000_000u64),
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let plan = sample_plan();
        let decoded = RoutePlan::decode(&plan.encode()).unwrap();
        assert_eq!(plan, decoded);
    }

    #[test]
    fn truncated_bytes_rejected() {
        let bytes = sample_plan().encode();
        let err = RoutePlan::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, EngineError::SignalDecode(_)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = sample_plan().encode();
        bytes.push(0);
        assert!(RoutePlan::decode(&bytes).is_err());
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = sample_plan().encode();
        bytes[0] = 7;
        assert!(matches!(
            RoutePlan::decode(&bytes),
            Err(EngineError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn build_converts_amounts_at_chain_boundary() {
        let registry = fixtures::registry();
        let signal = fixtures::signal(dec!(20), dec!(5), Utc::now());
        let plan = RoutePlan::build(&signal, &registry, 10).unwrap();

        // 1000 USDC at 6 decimals.
        assert_eq!(plan.amount_in, U256::from(1_000_000_000u64));
        assert_eq!(plan.vault, fixtures::addr(0xF2));
        assert_eq!(plan.hops.len(), 2);

        // min_out = 1025 * (1 - 0.001) in raw 6-decimals units.
        let expected = U256::from(1_023_975_000u64);
        assert_eq!(plan.min_out, expected);
    }

    #[test]
    fn build_rejects_unknown_provider() {
        let registry = fixtures::registry();
        let mut signal = fixtures::signal(dec!(20), dec!(5), Utc::now());
        signal.flash_loan_provider = "nonexistent".into();
        assert!(RoutePlan::build(&signal, &registry, 10).is_err());
    }

    mod round_trip_property {
        use super::*;
        use proptest::prelude::*;

        fn arb_address() -> impl Strategy<Value = Address> {
            any::<[u8; 20]>().prop_map(Address::from)
        }

        fn arb_hop() -> impl Strategy<Value = PlanHop> {
            prop_oneof![
                (1u8..=4, any::<u64>(), arb_address(), arb_address(), arb_address(), any::<u32>())
                    .prop_map(|(protocol, chain, pool, token_in, token_out, aux)| {
                        PlanHop::Swap { protocol, chain, pool, token_in, token_out, aux }
                    }),
                (any::<u64>(), any::<u64>(), arb_address(), "[a-z]{1,16}").prop_map(
                    |(chain_from, chain_to, token, provider)| PlanHop::Bridge {
                        chain_from,
                        chain_to,
                        token,
                        provider,
                    }
                ),
            ]
        }

        proptest! {
            #[test]
            fn any_plan_round_trips(
                hops in prop::collection::vec(arb_hop(), 1..5),
                vault in arb_address(),
                token_in in arb_address(),
                amount in any::<u128>(),
                min_out in any::<u128>(),
            ) {
                let plan = RoutePlan {
                    version: ROUTE_ENCODING_VERSION,
                    hops,
                    vault,
                    token_in,
                    amount_in: U256::from(amount),
                    min_out: U256::from(min_out),
                };
                prop_assert_eq!(RoutePlan::decode(&plan.encode()).unwrap(), plan);
            }
        }
    }
}
