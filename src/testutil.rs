//! Shared test support: mock RPC endpoints, a manual clock, and registry
//! fixtures. Compiled only for tests.

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::chain::endpoint::{ReceiptSummary, RpcEndpoint};
use crate::context::Clock;
use crate::errors::EngineError;
use crate::oracle::{PriceSet, UsdPrice};
use crate::types::{
    ChainId, Confidence, FeeBreakdown, FeeData, Hop, MevPolicy, Opportunity, Quote, Route, Signal,
    SIGNAL_VERSION,
};

/// Clock whose time only moves when a test says so.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn epoch() -> Self {
        Self::at(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock();
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Scriptable RPC endpoint.
pub struct MockEndpoint {
    url: String,
    failing: AtomicBool,
    block: AtomicU64,
    chain_id: AtomicU64,
    /// Default return for any eth_call.
    call_result: Mutex<Option<Bytes>>,
    /// Per-target overrides, keyed by `to` address.
    call_by_target: DashMap<Address, Bytes>,
    call_revert: Mutex<Option<String>>,
    gas_estimate: AtomicU64,
    fee_data: Mutex<FeeData>,
    nonce: AtomicU64,
    pub sent_raw: Mutex<Vec<Vec<u8>>>,
    receipt_status: AtomicBool,
}

impl MockEndpoint {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            failing: AtomicBool::new(false),
            block: AtomicU64::new(100),
            chain_id: AtomicU64::new(1),
            call_result: Mutex::new(None),
            call_by_target: DashMap::new(),
            call_revert: Mutex::new(None),
            gas_estimate: AtomicU64::new(400_000),
            fee_data: Mutex::new(FeeData {
                base_fee_per_gas: 20_000_000_000,
                max_priority_fee_per_gas: 2_000_000_000,
                gas_price: 22_000_000_000,
            }),
            nonce: AtomicU64::new(7),
            sent_raw: Mutex::new(Vec::new()),
            receipt_status: AtomicBool::new(true),
        }
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_block(self, block: u64) -> Self {
        self.block.store(block, Ordering::SeqCst);
        self
    }

    pub fn with_chain_id(self, id: u64) -> Self {
        self.chain_id.store(id, Ordering::SeqCst);
        self
    }

    pub fn with_call_result(self, result: Bytes) -> Self {
        *self.call_result.lock() = Some(result);
        self
    }

    pub fn with_call_for(self, target: Address, result: Bytes) -> Self {
        self.call_by_target.insert(target, result);
        self
    }

    pub fn with_call_revert(self, reason: &str) -> Self {
        *self.call_revert.lock() = Some(reason.to_string());
        self
    }

    pub fn with_gas_estimate(self, gas: u64) -> Self {
        self.gas_estimate.store(gas, Ordering::SeqCst);
        self
    }

    pub fn with_fee_data(self, fee: FeeData) -> Self {
        *self.fee_data.lock() = fee;
        self
    }

    pub fn with_nonce(self, nonce: u64) -> Self {
        self.nonce.store(nonce, Ordering::SeqCst);
        self
    }

    pub fn with_receipt_status(self, ok: bool) -> Self {
        self.receipt_status.store(ok, Ordering::SeqCst);
        self
    }

    // Mid-test mutation hooks.
    pub fn set_fee_data(&self, fee: FeeData) {
        *self.fee_data.lock() = fee;
    }

    pub fn set_call_result(&self, result: Bytes) {
        *self.call_result.lock() = Some(result);
    }

    pub fn set_call_revert(&self, reason: Option<&str>) {
        *self.call_revert.lock() = reason.map(str::to_string);
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.nonce.store(nonce, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent_raw.lock().len()
    }

    fn check_up(&self) -> Result<(), EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Rpc("mock endpoint down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RpcEndpoint for MockEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        self.check_up()?;
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn chain_id(&self) -> Result<u64, EngineError> {
        self.check_up()?;
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, EngineError> {
        self.check_up()?;
        if let Some(reason) = self.call_revert.lock().clone() {
            return Err(EngineError::Rpc(format!("execution reverted: {reason}")));
        }
        if let Some(to) = tx.to.and_then(|kind| kind.to().copied()) {
            if let Some(result) = self.call_by_target.get(&to) {
                return Ok(result.clone());
            }
        }
        Ok(self.call_result.lock().clone().unwrap_or_default())
    }

    async fn estimate_gas(&self, _tx: TransactionRequest) -> Result<u64, EngineError> {
        self.check_up()?;
        Ok(self.gas_estimate.load(Ordering::SeqCst))
    }

    async fn fee_data(&self) -> Result<FeeData, EngineError> {
        self.check_up()?;
        Ok(*self.fee_data.lock())
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<B256, EngineError> {
        self.check_up()?;
        let mut sent = self.sent_raw.lock();
        sent.push(raw);
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&(sent.len() as u64).to_be_bytes());
        Ok(B256::from(hash))
    }

    async fn pending_nonce(&self, _address: Address) -> Result<u64, EngineError> {
        self.check_up()?;
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn receipt(&self, _tx_hash: B256) -> Result<Option<ReceiptSummary>, EngineError> {
        self.check_up()?;
        Ok(Some(ReceiptSummary {
            status: self.receipt_status.load(Ordering::SeqCst),
            block_number: self.block.load(Ordering::SeqCst),
            gas_used: 350_000,
        }))
    }
}

/// A ready-made core context over mock endpoints, a queue bus, a static
/// oracle and a manual clock.
pub fn test_context(
    mode: crate::config::ExecutionMode,
    endpoint: Arc<MockEndpoint>,
    clock: Arc<dyn Clock>,
) -> crate::context::CoreContext {
    use crate::chain::{ChainClient, ChainClientPool};
    use crate::oracle::StaticOracle;
    use std::collections::HashMap;
    use std::time::Duration;

    let settings = Arc::new(fixtures::settings(mode));
    let registry = fixtures::registry();
    let metrics = Arc::new(crate::metrics::Metrics::new());
    let client = Arc::new(ChainClient::new(
        fixtures::CHAIN_ETH,
        "ethereum".into(),
        vec![endpoint.clone() as Arc<dyn crate::chain::RpcEndpoint>],
        None,
        None,
        Arc::clone(&metrics),
    ));
    let chains = Arc::new(ChainClientPool::from_clients(
        vec![client],
        Duration::from_secs(10),
    ));
    let prices: HashMap<String, rust_decimal::Decimal> = [
        ("usd-coin".to_string(), dec!(1)),
        ("dai".to_string(), dec!(1)),
        ("ethereum".to_string(), dec!(2500)),
        ("matic-network".to_string(), dec!(0.5)),
    ]
    .into_iter()
    .collect();

    crate::context::CoreContext {
        settings,
        registry,
        chains,
        bus: Arc::new(crate::bus::queue::QueueBus::new(64)),
        oracle: Arc::new(StaticOracle::new(prices, Arc::clone(&clock))),
        clock,
        metrics,
    }
}

/// Registry and domain-object fixtures shared across module tests.
pub mod fixtures {
    use super::*;
    use crate::registry::{
        BridgeLane, ChainMeta, FlashProvider, Pool, PoolKind, Registry, Token,
    };

    pub const CHAIN_ETH: ChainId = 1;
    pub const CHAIN_POLY: ChainId = 137;

    pub fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    pub fn usdc() -> Address {
        addr(0xA1)
    }

    pub fn weth() -> Address {
        addr(0xA2)
    }

    pub fn dai() -> Address {
        addr(0xA3)
    }

    pub fn usdc_poly() -> Address {
        addr(0xB1)
    }

    pub fn wmatic() -> Address {
        addr(0xB2)
    }

    pub fn executor_eth() -> Address {
        addr(0xE1)
    }

    pub fn chains() -> Vec<ChainMeta> {
        vec![
            ChainMeta {
                chain_id: CHAIN_ETH,
                name: "ethereum".into(),
                executor: executor_eth(),
                multicall: None,
                native_canonical: "ethereum".into(),
                anchors: vec![usdc(), weth()],
            },
            ChainMeta {
                chain_id: CHAIN_POLY,
                name: "polygon".into(),
                executor: addr(0xE2),
                multicall: None,
                native_canonical: "matic-network".into(),
                anchors: vec![usdc_poly()],
            },
        ]
    }

    pub fn tokens() -> Vec<Token> {
        vec![
            Token {
                address: usdc(),
                chain: CHAIN_ETH,
                decimals: 6,
                symbol: "USDC".into(),
                canonical: "usd-coin".into(),
            },
            Token {
                address: weth(),
                chain: CHAIN_ETH,
                decimals: 18,
                symbol: "WETH".into(),
                canonical: "ethereum".into(),
            },
            Token {
                address: dai(),
                chain: CHAIN_ETH,
                decimals: 18,
                symbol: "DAI".into(),
                canonical: "dai".into(),
            },
            Token {
                address: usdc_poly(),
                chain: CHAIN_POLY,
                decimals: 6,
                symbol: "USDC.e".into(),
                canonical: "usd-coin".into(),
            },
            Token {
                address: wmatic(),
                chain: CHAIN_POLY,
                decimals: 18,
                symbol: "WMATIC".into(),
                canonical: "matic-network".into(),
            },
        ]
    }

    pub fn pools() -> Vec<Pool> {
        vec![
            Pool {
                address: addr(0xC1),
                chain: CHAIN_ETH,
                tokens: vec![usdc(), weth()],
                kind: PoolKind::V2 { fee_bps: 30 },
            },
            Pool {
                address: addr(0xC2),
                chain: CHAIN_ETH,
                tokens: vec![usdc(), weth()],
                kind: PoolKind::V3 { fee_ppm: 500 },
            },
            Pool {
                address: addr(0xC3),
                chain: CHAIN_ETH,
                tokens: vec![usdc(), dai()],
                kind: PoolKind::Curve { amplification: 200, fee_bps: 4 },
            },
            Pool {
                address: addr(0xC4),
                chain: CHAIN_ETH,
                tokens: vec![usdc(), weth()],
                kind: PoolKind::Balancer {
                    swap_fee_bps: 30,
                    weights: vec![dec!(0.2), dec!(0.8)],
                },
            },
            Pool {
                address: addr(0xD1),
                chain: CHAIN_POLY,
                tokens: vec![usdc_poly(), wmatic()],
                kind: PoolKind::V2 { fee_bps: 30 },
            },
        ]
    }

    pub fn providers() -> Vec<FlashProvider> {
        vec![
            FlashProvider {
                id: "aave-v3".into(),
                chain: CHAIN_ETH,
                vault: addr(0xF1),
                fee_bps: 5,
                rank: 1,
            },
            FlashProvider {
                id: "balancer-v2".into(),
                chain: CHAIN_ETH,
                vault: addr(0xF2),
                fee_bps: 0,
                rank: 2,
            },
            FlashProvider {
                id: "aave-v3-polygon".into(),
                chain: CHAIN_POLY,
                vault: addr(0xF3),
                fee_bps: 5,
                rank: 1,
            },
        ]
    }

    pub fn bridges() -> Vec<BridgeLane> {
        vec![BridgeLane {
            provider: "hop".into(),
            chain_from: CHAIN_ETH,
            chain_to: CHAIN_POLY,
            canonical: "usd-coin".into(),
            fee_bps: 4,
        }]
    }

    pub fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::from_parts(chains(), tokens(), pools(), providers(), bridges()).unwrap(),
        )
    }

    pub fn prices() -> PriceSet {
        let observed_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut set = PriceSet::new();
        for (id, price) in [
            ("usd-coin", dec!(1)),
            ("dai", dec!(1)),
            ("ethereum", dec!(2500)),
            ("matic-network", dec!(0.5)),
        ] {
            set.insert(id, UsdPrice { price, observed_at });
        }
        set
    }

    pub fn swap_quote(
        pool: Address,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
        amount_out: Decimal,
        block: u64,
    ) -> Quote {
        Quote {
            chain: CHAIN_ETH,
            pool,
            token_in,
            token_out,
            amount_in,
            amount_out,
            effective_price: if amount_in.is_zero() {
                Decimal::ZERO
            } else {
                amount_out / amount_in
            },
            depth_used: dec!(0.01),
            source_block: block,
            observed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    /// USDC -> WETH -> USDC cycle on chain 1 with configurable output.
    pub fn cycle_route(amount_in: Decimal, amount_out: Decimal, block: u64) -> Route {
        let mid = amount_in / dec!(2500);
        Route {
            hops: vec![
                Hop::Swap(swap_quote(addr(0xC1), usdc(), weth(), amount_in, mid, block)),
                Hop::Swap(swap_quote(addr(0xC2), weth(), usdc(), mid, amount_out, block)),
            ],
            chain: CHAIN_ETH,
            token_in: usdc(),
            source_blocks: BTreeMap::from([(CHAIN_ETH, block)]),
        }
    }

    /// A ready-made opportunity with the given profit/gas economics.
    pub fn opportunity(net_profit: Decimal, gas_cost: Decimal) -> Opportunity {
        let input = dec!(1000);
        let gross_out = input + net_profit + gas_cost;
        Opportunity {
            route: cycle_route(input, gross_out, 100),
            input_amount: input,
            gross_out_usd: gross_out,
            loan_cost_usd: input,
            gross_spread_usd: gross_out - input,
            fees: FeeBreakdown {
                flash_loan_fee: Decimal::ZERO,
                gas_cost,
                bridge_fee: Decimal::ZERO,
                slippage_reserve: Decimal::ZERO,
            },
            net_profit_usd: net_profit,
            gas_cost_usd: gas_cost,
            estimated_gas_units: 400_000,
            confidence: Confidence::High,
        }
    }

    /// Engine settings with test-friendly defaults: one chain, queue bus,
    /// static prices, permissive thresholds.
    pub fn settings(mode: crate::config::ExecutionMode) -> crate::config::Settings {
        use crate::config::{BusKind, ChainSettings};
        use std::collections::HashMap;
        use std::path::PathBuf;
        use std::time::Duration;

        crate::config::Settings {
            mode,
            min_profit_usd: dec!(5),
            max_base_fee_gwei: 150,
            max_consecutive_failures: 10,
            scan_interval: Duration::from_millis(1_000),
            flash_loan_enabled: true,
            flash_loan_provider: "balancer-v2".into(),
            mev_policy: crate::types::MevPolicy::AllowPublic,
            chains: vec![ChainSettings {
                name: "ethereum".into(),
                chain_id: CHAIN_ETH,
                rpc_urls: vec!["http://mock".into()],
                private_relay_url: None,
            }],
            private_key:
                "0x0000000000000000000000000000000000000000000000000000000000000001".into(),
            slippage_bps: 0,
            freshness_blocks: 2,
            max_hops: 4,
            sim_tolerance_bps: 1_000,
            high_value_usd: dec!(50000),
            min_notional_usd: dec!(100),
            probe_points: 5,
            max_depth_share_bps: 1_000,
            bus_kind: BusKind::Queue,
            bus_dir: PathBuf::from("signals"),
            signal_ttl: Duration::from_secs(5),
            oracle_url: None,
            oracle_max_age: Duration::from_secs(60),
            static_prices: HashMap::from([("usd-coin".to_string(), dec!(1))]),
            registry_path: PathBuf::from("registry.json"),
            rpc_timeout: Duration::from_millis(500),
            probe_interval: Duration::from_secs(10),
            worker_threads: 2,
        }
    }

    pub fn signal(net_profit: Decimal, gas_cost: Decimal, now: DateTime<Utc>) -> Signal {
        Signal {
            version: SIGNAL_VERSION,
            id: Uuid::new_v4(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(5),
            flash_loan_provider: "balancer-v2".into(),
            mev_policy: MevPolicy::AllowPublic,
            opportunity: opportunity(net_profit, gas_cost),
        }
    }
}
