//! Execution Engine
//!
//! Consumes signals from the bus and drives each through the fixed state
//! machine: RECEIVED -> VALIDATED -> SIMULATED -> SUBMITTED -> CONFIRMED /
//! REVERTED, with REJECTED and EXPIRED branches. The safety envelope lives
//! here and trusts nothing upstream: flash-loan enforcement, the gas
//! ceiling, re-validation of both profit floors with current data, nonce
//! discipline, and no-retry-after-simulation-failure.
//!
//! Signals on different chains process in parallel; signals on the same
//! chain serialize on a per-chain lock so the nonce manager sees them in
//! order. PAPER mode runs the identical pipeline and short-circuits after
//! SIMULATED.

pub mod encoding;
pub mod mev;
pub mod nonce;
pub mod record;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolCall;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ReceiptSummary};
use crate::config::ExecutionMode;
use crate::context::CoreContext;
use crate::errors::{EngineError, RejectReason};
use crate::metrics::Metrics;
use crate::pricer::state::raw_to_decimal;
use crate::supervisor::CircuitBreaker;
use crate::types::{ChainId, FeeData, Hop, Signal};
use encoding::RoutePlan;
use record::{ExecState, RecordStore};

/// Gas estimates above this mean the node simulated a revert.
const MAX_REASONABLE_GAS: u64 = 1_500_000;

/// Buffer applied to the gas estimate for the submitted limit.
const GAS_BUFFER_PERCENT: u64 = 12;

const CONFIRM_POLL: Duration = Duration::from_millis(500);
const CONFIRM_ATTEMPTS: u32 = 60;

const WEI_PER_ETHER: i128 = 1_000_000_000_000_000_000;

sol! {
    /// On-chain executor entry point. The route blob is the versioned
    /// encoding from `encoding::RoutePlan`.
    interface IRouteExecutor {
        function executeRoute(bytes calldata route) external returns (int256 profit);
    }
}

/// Everything simulation learned, reused by submission and confirmation.
struct SimOutcome {
    calldata: Vec<u8>,
    gas_limit: u64,
    fee: FeeData,
    /// Contract-reported profit (pre-gas) in USD at current oracle rates.
    sim_profit_usd: Decimal,
    gas_cost_now_usd: Decimal,
    net_profit_now_usd: Decimal,
    usd_native: Decimal,
}

pub struct ExecutionEngine {
    ctx: CoreContext,
    breaker: Arc<CircuitBreaker>,
    records: Arc<RecordStore>,
    wallet: EthereumWallet,
    address: Address,
    nonces: HashMap<ChainId, Arc<nonce::NonceManager>>,
    chain_locks: HashMap<ChainId, Arc<tokio::sync::Mutex<()>>>,
}

impl ExecutionEngine {
    pub fn new(ctx: CoreContext, breaker: Arc<CircuitBreaker>) -> Result<Self, EngineError> {
        let signer: PrivateKeySigner = ctx
            .settings
            .private_key
            .parse()
            .map_err(|e| EngineError::ConfigInvalid(format!("PRIVATE_KEY: {e}")))?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);

        // Startup half of the flash-loan kill switch; the other half runs
        // before every submission.
        if !ctx.settings.flash_loan_enabled {
            warn!("flash loans disabled: every signal will terminate REJECTED");
        }

        let mut nonces = HashMap::new();
        let mut chain_locks = HashMap::new();
        for chain in ctx.registry.chain_ids() {
            nonces.insert(chain, Arc::new(nonce::NonceManager::new(chain, address)));
            chain_locks.insert(chain, Arc::new(tokio::sync::Mutex::new(())));
        }

        Ok(Self {
            ctx,
            breaker,
            records: Arc::new(RecordStore::new()),
            wallet,
            address,
            nonces,
            chain_locks,
        })
    }

    pub fn records(&self) -> Arc<RecordStore> {
        Arc::clone(&self.records)
    }

    pub fn submitter_address(&self) -> Address {
        self.address
    }

    /// Consume loop. On shutdown it stops accepting signals and drains
    /// in-flight ones to a terminal state before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut inflight: JoinSet<()> = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.ctx.bus.consume().await {
                Ok(Some(signal)) => {
                    Metrics::incr(&self.ctx.metrics.signals_consumed);
                    let engine = Arc::clone(&self);
                    inflight.spawn(async move {
                        engine.process(signal).await;
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(EngineError::UnsupportedVersion(version)) => {
                    warn!(version, "rejected signal with unsupported version");
                }
                Err(EngineError::SignalDecode(err)) => {
                    warn!(%err, "undecodable signal dropped");
                }
                Err(err) => {
                    Metrics::incr(&self.ctx.metrics.bus_errors);
                    warn!(%err, "bus consume failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
            while inflight.try_join_next().is_some() {}
        }

        info!("execution engine draining in-flight signals");
        while inflight.join_next().await.is_some() {}
        info!("execution engine stopped");
    }

    /// Drive one signal through the state machine. The pipeline within a
    /// signal is strictly sequential; signals on different chains run in
    /// parallel, and a per-chain lock inside `submit` serializes only the
    /// SUBMITTED transition for the nonce manager.
    pub async fn process(&self, signal: Signal) {
        let id = signal.id;
        let now = self.ctx.clock.now();

        // RECEIVED: the record exists before any network effect. A known
        // id is rejected without touching the existing record.
        if self.records.create(id, now).is_err() {
            warn!(signal = %id, reason = RejectReason::DuplicateSignal.tag(), "duplicate signal rejected");
            return;
        }
        self.event(id, ExecState::Received);

        // VALIDATED
        if let Err(reason) = self.validate(&signal) {
            self.finish(id, reason);
            return;
        }
        self.records
            .transition(id, ExecState::Validated, self.ctx.clock.now());
        Metrics::incr(&self.ctx.metrics.exec_validated);
        self.event(id, ExecState::Validated);

        // SIMULATED
        let sim = match self.simulate(&signal).await {
            Ok(sim) => sim,
            Err(reason) => {
                self.finish(id, reason);
                return;
            }
        };
        self.records
            .transition(id, ExecState::Simulated, self.ctx.clock.now());
        Metrics::incr(&self.ctx.metrics.exec_simulated);
        self.event(id, ExecState::Simulated);
        info!(
            signal = %id,
            sim_profit_usd = %sim.sim_profit_usd,
            gas_cost_now_usd = %sim.gas_cost_now_usd,
            net_profit_now_usd = %sim.net_profit_now_usd,
            "simulation passed"
        );
        self.breaker.record_simulation_passed();

        // PAPER settles here: simulated profit becomes realized profit.
        if self.ctx.settings.mode == ExecutionMode::Paper {
            self.records
                .transition(id, ExecState::Confirmed, self.ctx.clock.now());
            self.records.set_final_profit(id, sim.net_profit_now_usd);
            Metrics::incr(&self.ctx.metrics.exec_confirmed);
            self.event(id, ExecState::Confirmed);
            self.breaker.record_success();
            info!(
                signal = %id,
                realized_usd = %sim.net_profit_now_usd,
                "paper execution confirmed"
            );
            return;
        }

        // SUBMITTED
        let tx_hash = match self.submit(&signal, &sim).await {
            Ok(hash) => hash,
            Err(reason) => {
                self.finish(id, reason);
                return;
            }
        };
        self.records
            .transition(id, ExecState::Submitted, self.ctx.clock.now());
        self.records.set_tx_hash(id, tx_hash);
        Metrics::incr(&self.ctx.metrics.exec_submitted);
        self.event(id, ExecState::Submitted);

        // CONFIRMED / REVERTED
        let chain_client = match self.ctx.chains.get(signal.opportunity.route.chain) {
            Some(client) => client,
            None => return,
        };
        match self.await_receipt(&chain_client, tx_hash).await {
            Some(receipt) if receipt.status => {
                self.records
                    .transition(id, ExecState::Confirmed, self.ctx.clock.now());
                self.records.set_final_profit(id, sim.net_profit_now_usd);
                Metrics::incr(&self.ctx.metrics.exec_confirmed);
                self.event(id, ExecState::Confirmed);
                self.breaker.record_success();
                info!(signal = %id, tx = %tx_hash, "execution confirmed");
            }
            Some(receipt) => {
                // Realized loss: the gas actually burned, negative.
                let gas_loss = Decimal::from(receipt.gas_used)
                    * Decimal::from_i128_with_scale(sim.fee.gas_price as i128, 0)
                    / Decimal::from_i128_with_scale(WEI_PER_ETHER, 0)
                    * sim.usd_native;
                self.records
                    .transition(id, ExecState::Reverted, self.ctx.clock.now());
                self.records.set_final_profit(id, -gas_loss);
                self.records
                    .set_failure(id, RejectReason::RevertedOnChain("status 0".into()));
                Metrics::incr(&self.ctx.metrics.exec_reverted);
                self.event(id, ExecState::Reverted);
                self.breaker.record_failure();
                warn!(signal = %id, tx = %tx_hash, "execution reverted on-chain");
            }
            None => {
                // Still pending when we gave up: the record stays at
                // SUBMITTED; reconciliation against the chain happens on
                // the next boot.
                warn!(signal = %id, tx = %tx_hash, "confirmation still pending, leaving record SUBMITTED");
            }
        }
    }

    /// Static checks; nothing here touches the network.
    fn validate(&self, signal: &Signal) -> Result<(), RejectReason> {
        let route = &signal.opportunity.route;

        if signal.is_expired(self.ctx.clock.now()) {
            return Err(RejectReason::SignalExpired);
        }
        if !self.ctx.settings.flash_loan_enabled {
            return Err(RejectReason::FlashLoanDisabled);
        }
        if signal.flash_loan_provider.is_empty() {
            return Err(RejectReason::SelfFundedRoute);
        }
        let provider = self
            .ctx
            .registry
            .provider(&signal.flash_loan_provider)
            .ok_or_else(|| RejectReason::UnknownProvider(signal.flash_loan_provider.clone()))?;
        if provider.chain != route.chain {
            return Err(RejectReason::UnknownProvider(signal.flash_loan_provider.clone()));
        }
        if route.hop_count() == 0 || route.hop_count() > self.ctx.settings.max_hops {
            return Err(RejectReason::TooManyHops {
                hops: route.hop_count(),
                max: self.ctx.settings.max_hops,
            });
        }
        for hop in &route.hops {
            if let Hop::Swap(quote) = hop {
                if self.ctx.registry.token(quote.chain, quote.token_in).is_none() {
                    return Err(RejectReason::UnknownToken(quote.token_in.to_string()));
                }
                if self.ctx.registry.token(quote.chain, quote.token_out).is_none() {
                    return Err(RejectReason::UnknownToken(quote.token_out.to_string()));
                }
            }
        }
        if !self.ctx.chains.is_available(route.chain) {
            return Err(RejectReason::ChainUnavailable(route.chain));
        }
        Ok(())
    }

    /// Assemble and dry-run the full transaction at the current head, then
    /// re-validate both profit floors with current gas and oracle data.
    /// Simulation failure is terminal for the signal; there is no retry
    /// with adjusted parameters.
    async fn simulate(&self, signal: &Signal) -> Result<SimOutcome, RejectReason> {
        let route = &signal.opportunity.route;
        let chain = route.chain;
        let client = self
            .ctx
            .chains
            .get(chain)
            .ok_or(RejectReason::ChainUnavailable(chain))?;
        let meta = self
            .ctx
            .registry
            .chain(chain)
            .ok_or(RejectReason::ChainUnavailable(chain))?;

        let plan = RoutePlan::build(signal, &self.ctx.registry, self.ctx.settings.slippage_bps)
            .map_err(|e| RejectReason::SimulationReverted(e.to_string()))?;
        let route_bytes = plan.encode();
        debug!(signal = %signal.id, route = %hex::encode(&route_bytes), "route assembled");
        let calldata = IRouteExecutor::executeRouteCall {
            route: Bytes::from(route_bytes),
        }
        .abi_encode();

        let mut tx = TransactionRequest::default()
            .to(meta.executor)
            .input(TransactionInput::new(Bytes::from(calldata.clone())));
        tx.from = Some(self.address);

        // Gas ceiling comes first: no point simulating what we refuse to pay for.
        let fee = client
            .fee_data()
            .await
            .map_err(|_| RejectReason::ChainUnavailable(chain))?;
        if fee.base_fee_gwei() > self.ctx.settings.max_base_fee_gwei {
            return Err(RejectReason::GasPriceAboveCeiling {
                base_fee_gwei: fee.base_fee_gwei(),
                max_gwei: self.ctx.settings.max_base_fee_gwei,
            });
        }

        let returned = client
            .call(tx.clone())
            .await
            .map_err(|e| RejectReason::SimulationReverted(e.to_string()))?;
        let profit_raw = IRouteExecutor::executeRouteCall::abi_decode_returns(&returned)
            .map_err(|e| RejectReason::SimulationReverted(format!("bad return data: {e}")))?;

        let gas_units = client
            .estimate_gas(tx)
            .await
            .map_err(|e| RejectReason::SimulationReverted(e.to_string()))?;
        if gas_units > MAX_REASONABLE_GAS {
            // eth_estimateGas explodes when the underlying call would
            // revert; treat it the same.
            return Err(RejectReason::SimulationReverted(format!(
                "gas estimate {gas_units} above sanity cap"
            )));
        }

        let token_in = self
            .ctx
            .registry
            .token(chain, route.token_in)
            .ok_or_else(|| RejectReason::UnknownToken(route.token_in.to_string()))?;
        let usd_in = self.usd_now(&token_in.canonical).await?;
        let usd_native = self.usd_now(&meta.native_canonical).await?;

        let profit_magnitude = raw_to_decimal(profit_raw.unsigned_abs(), token_in.decimals)
            .map_err(|e| RejectReason::SimulationReverted(format!("profit decode: {e}")))?;
        let sim_profit_usd = if profit_raw.is_negative() {
            -profit_magnitude * usd_in
        } else {
            profit_magnitude * usd_in
        };

        // The contract reports pre-gas profit; the declared equivalent is
        // net plus the gas the scanner budgeted.
        let declared_pre_gas =
            signal.opportunity.net_profit_usd + signal.opportunity.fees.gas_cost;
        let tolerance = Decimal::ONE
            - Decimal::new(self.ctx.settings.sim_tolerance_bps as i64, 4);
        if sim_profit_usd < declared_pre_gas * tolerance {
            return Err(RejectReason::SimulationProfitShortfall);
        }

        let gas_cost_now_usd = Decimal::from(gas_units)
            * Decimal::from_i128_with_scale(fee.gas_price as i128, 0)
            / Decimal::from_i128_with_scale(WEI_PER_ETHER, 0)
            * usd_native;
        let net_profit_now_usd = sim_profit_usd - gas_cost_now_usd;

        // Re-validation with current data; the scanner's view is not trusted.
        if net_profit_now_usd < Decimal::TWO * gas_cost_now_usd {
            return Err(RejectReason::NetProfitBelowGasFloor);
        }
        if net_profit_now_usd < self.ctx.settings.min_profit_usd {
            return Err(RejectReason::NetProfitBelowMinimum);
        }

        Ok(SimOutcome {
            calldata,
            gas_limit: gas_units + gas_units * GAS_BUFFER_PERCENT / 100,
            fee,
            sim_profit_usd,
            gas_cost_now_usd,
            net_profit_now_usd,
            usd_native,
        })
    }

    async fn usd_now(&self, canonical: &str) -> Result<Decimal, RejectReason> {
        self.ctx
            .oracle
            .usd_price(canonical)
            .await
            .map(|p| p.price)
            .map_err(|_| RejectReason::OracleMissing(canonical.to_string()))
    }

    /// Sign and send. Per-chain submissions are strictly serial (the lock
    /// covers nonce reservation through send), and nonce conflicts get
    /// exactly one resync-and-retry.
    async fn submit(&self, signal: &Signal, sim: &SimOutcome) -> Result<B256, RejectReason> {
        let chain = signal.opportunity.route.chain;
        let serial = self
            .chain_locks
            .get(&chain)
            .ok_or(RejectReason::ChainUnavailable(chain))?;
        let _serial = serial.lock().await;
        let client = self
            .ctx
            .chains
            .get(chain)
            .ok_or(RejectReason::ChainUnavailable(chain))?;

        // Second half of the kill switch, immediately before submission.
        if !self.ctx.settings.flash_loan_enabled {
            return Err(RejectReason::FlashLoanDisabled);
        }

        let route = mev::route_submission(
            signal.mev_policy,
            signal.opportunity.loan_cost_usd,
            self.ctx.settings.high_value_usd,
            client.relay_healthy(),
        )?;

        let manager = self
            .nonces
            .get(&chain)
            .ok_or(RejectReason::ChainUnavailable(chain))?;

        let mut retried = false;
        loop {
            let nonce_value = manager
                .reserve(&client)
                .await
                .map_err(|_| RejectReason::ChainUnavailable(chain))?;
            let raw = self.sign_transaction(chain, signal, sim, nonce_value).await?;

            let sent = match route {
                mev::SubmissionRoute::PrivateRelay => client.send_raw_private(raw).await,
                mev::SubmissionRoute::PublicMempool => client.send_raw_transaction(raw).await,
            };

            match sent {
                Ok(hash) => return Ok(hash),
                Err(EngineError::SubmissionRejected(msg))
                    if msg.to_ascii_lowercase().contains("nonce") =>
                {
                    if retried {
                        return Err(RejectReason::NonceConflict);
                    }
                    retried = true;
                    warn!(chain, %msg, "nonce conflict, resyncing once");
                    manager
                        .resync(&client)
                        .await
                        .map_err(|_| RejectReason::NonceConflict)?;
                }
                Err(err) => {
                    manager.release(nonce_value);
                    return Err(RejectReason::SubmissionRejected(err.to_string()));
                }
            }
        }
    }

    async fn sign_transaction(
        &self,
        chain: ChainId,
        signal: &Signal,
        sim: &SimOutcome,
        nonce_value: u64,
    ) -> Result<Vec<u8>, RejectReason> {
        let meta = self
            .ctx
            .registry
            .chain(chain)
            .ok_or(RejectReason::ChainUnavailable(chain))?;

        let mut tx = TransactionRequest::default()
            .to(meta.executor)
            .input(TransactionInput::new(Bytes::from(sim.calldata.clone())));
        tx.from = Some(self.address);
        tx.nonce = Some(nonce_value);
        tx.gas = Some(sim.gas_limit);
        tx.chain_id = Some(chain);
        tx.max_priority_fee_per_gas = Some(sim.fee.max_priority_fee_per_gas);
        tx.max_fee_per_gas =
            Some(sim.fee.base_fee_per_gas * 2 + sim.fee.max_priority_fee_per_gas);

        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| RejectReason::SubmissionRejected(format!("signing: {e}")))?;
        debug!(signal = %signal.id, nonce = nonce_value, "transaction signed");
        Ok(envelope.encoded_2718())
    }

    async fn await_receipt(
        &self,
        client: &Arc<ChainClient>,
        tx_hash: B256,
    ) -> Option<ReceiptSummary> {
        for _ in 0..CONFIRM_ATTEMPTS {
            match client.receipt(tx_hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(err) => debug!(%err, "receipt poll failed"),
            }
            tokio::time::sleep(CONFIRM_POLL).await;
        }
        None
    }

    /// Terminal bookkeeping for a rejected/expired/failed signal.
    fn finish(&self, id: uuid::Uuid, reason: RejectReason) {
        let now = self.ctx.clock.now();
        let state = match &reason {
            RejectReason::SignalExpired => ExecState::Expired,
            RejectReason::RevertedOnChain(_) => ExecState::Reverted,
            _ => ExecState::Rejected,
        };
        self.records.transition(id, state, now);
        self.records.set_failure(id, reason.clone());

        match state {
            ExecState::Expired => Metrics::incr(&self.ctx.metrics.signals_expired),
            ExecState::Reverted => Metrics::incr(&self.ctx.metrics.exec_reverted),
            _ => Metrics::incr(&self.ctx.metrics.exec_rejected),
        }
        if reason.counts_toward_breaker() {
            self.breaker.record_failure();
        }
        self.event(id, state);
        info!(
            signal = %id,
            state = state.tag(),
            reason = reason.tag(),
            detail = %reason,
            "signal terminal"
        );
    }

    /// Structured event per state transition, stable tag + signal id.
    fn event(&self, id: uuid::Uuid, state: ExecState) {
        debug!(signal = %id, state = state.tag(), "state transition");
    }
}
