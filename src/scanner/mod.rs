//! Opportunity Scanner
//!
//! Periodic driver: every tick it pulls fee data and pool state for each
//! active chain in parallel, builds the token multigraph, enumerates cycles
//! from the anchor tokens, sizes each candidate with a geometric probe
//! sweep, filters through the profit engine, and emits survivors on the bus
//! in non-increasing net profit. Heavy enumeration runs on the blocking
//! pool behind a semaphore so the async runtime stays responsive.

pub mod cycles;
pub mod graph;

use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::CoreContext;
use crate::errors::{EngineError, QuoteReason};
use crate::metrics::Metrics;
use crate::oracle::PriceSet;
use crate::pricer::state::PoolSnapshot;
use crate::pricer::{Pricer, StateFetcher};
use crate::profit::{select_and_order, ProfitEngine};
use crate::registry::Registry;
use crate::types::{
    BridgeQuote, ChainId, Confidence, FeeData, Hop, Opportunity, Route, Signal, SIGNAL_VERSION,
};
use cycles::Cycle;
use graph::{EdgeKind, TokenGraph};

/// Flash-loan wrap overhead on top of the per-hop costs.
const GAS_FLASH_OVERHEAD: u64 = 120_000;
const GAS_PER_SWAP_HOP: u64 = 150_000;
const GAS_PER_BRIDGE_HOP: u64 = 250_000;

/// A pool whose two-way spot rates multiply above this is corrupt data.
const MAX_ROUND_TRIP_PRODUCT: Decimal = dec!(1.001);

/// Everything fetched for one chain in one tick.
struct ChainScan {
    chain: ChainId,
    head: u64,
    fee_data: FeeData,
    snapshots: Vec<Arc<PoolSnapshot>>,
}

pub struct Scanner {
    ctx: CoreContext,
    fetcher: Arc<StateFetcher>,
    pricer: Arc<Pricer>,
    profit: Arc<ProfitEngine>,
    /// Current tick interval in ms; the supervisor owns the value.
    interval_ms: Arc<AtomicU64>,
    eval_permits: Arc<Semaphore>,
}

impl Scanner {
    pub fn new(ctx: CoreContext, interval_ms: Arc<AtomicU64>) -> Self {
        let registry = Arc::clone(&ctx.registry);
        let profit = ProfitEngine::new(
            Arc::clone(&registry),
            ctx.settings.min_profit_usd,
            ctx.settings.slippage_bps,
        );
        Self {
            fetcher: Arc::new(StateFetcher::new(Arc::clone(&registry))),
            pricer: Arc::new(Pricer::new(registry)),
            profit: Arc::new(profit),
            eval_permits: Arc::new(Semaphore::new(ctx.settings.worker_threads)),
            interval_ms,
            ctx,
        }
    }

    /// Main loop. The interval is re-read every round so circuit-breaker
    /// backoff takes effect on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                info!("scanner stopped");
                return;
            }
            let emitted = self.tick().await;
            debug!(emitted, "scan tick complete");

            let wait = Duration::from_millis(self.interval_ms.load(Ordering::Relaxed).max(1));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One scan tick. Returns the number of signals emitted.
    pub async fn tick(&self) -> usize {
        let started = std::time::Instant::now();
        Metrics::incr(&self.ctx.metrics.scan_ticks);

        let prices = self.resolve_prices().await;
        let scans = self.fetch_all_chains().await;
        if scans.is_empty() {
            debug!("no healthy chains this tick");
            self.ctx
                .metrics
                .last_tick_ms
                .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            return 0;
        }

        let snapshots = index_snapshots(&scans);
        let graph = self.build_graph(&scans, &snapshots, &prices);
        let fee_by_chain: HashMap<ChainId, FeeData> =
            scans.iter().map(|s| (s.chain, s.fee_data)).collect();

        let candidates = self
            .evaluate_candidates(graph, snapshots, fee_by_chain, prices)
            .await;
        self.ctx
            .metrics
            .opportunities_found
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);

        let survivors = select_and_order(candidates);
        let emitted = self.emit_signals(survivors).await;

        self.ctx
            .metrics
            .last_tick_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        emitted
    }

    /// Resolve USD rates for every canonical the registry knows. Tokens the
    /// oracle cannot price drop out; candidates touching them are rejected
    /// downstream with an oracle reason.
    async fn resolve_prices(&self) -> PriceSet {
        let mut canonicals: HashSet<String> = HashSet::new();
        for chain in self.ctx.registry.chain_ids() {
            if let Some(meta) = self.ctx.registry.chain(chain) {
                canonicals.insert(meta.native_canonical.clone());
            }
            for pool in self.ctx.registry.pools(chain) {
                for token in &pool.tokens {
                    if let Some(token) = self.ctx.registry.token(chain, *token) {
                        canonicals.insert(token.canonical.clone());
                    }
                }
            }
        }

        let mut prices = PriceSet::new();
        for canonical in canonicals {
            match self.ctx.oracle.usd_price(&canonical).await {
                Ok(price) => prices.insert(canonical, price),
                Err(err) => warn!(%canonical, %err, "oracle price unavailable, candidates touching it will drop"),
            }
        }
        prices
    }

    /// Fetch head/fees/pool state for each available chain in parallel,
    /// bounded by the tick budget. Chains that miss the budget are skipped.
    async fn fetch_all_chains(&self) -> Vec<ChainScan> {
        let budget = self.ctx.settings.scan_interval;
        let futures = self.ctx.registry.chain_ids().map(|chain| {
            let ctx = self.ctx.clone();
            let fetcher = Arc::clone(&self.fetcher);
            async move {
                let client = ctx.chains.get(chain)?;
                if !client.is_available() {
                    return None;
                }
                let scan = tokio::time::timeout(budget, async {
                    let head = client.block_number().await?;
                    let fee_data = client.fee_data().await?;
                    let snapshots = fetcher.fetch_chain(&client, head).await?;
                    Ok::<_, EngineError>(ChainScan {
                        chain,
                        head,
                        fee_data,
                        snapshots,
                    })
                })
                .await;
                match scan {
                    Ok(Ok(scan)) => Some(scan),
                    Ok(Err(err)) => {
                        warn!(chain, %err, "chain scan failed this tick");
                        None
                    }
                    Err(_) => {
                        warn!(chain, "chain scan exceeded tick budget, cancelled");
                        None
                    }
                }
            }
        });
        futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Build the multigraph: every pool contributes one labeled edge per
    /// direction; bridge lanes connect canonical equivalents.
    fn build_graph(
        &self,
        scans: &[ChainScan],
        snapshots: &HashMap<(ChainId, alloy::primitives::Address), Arc<PoolSnapshot>>,
        prices: &PriceSet,
    ) -> TokenGraph {
        let mut token_graph = TokenGraph::new();

        for scan in scans {
            for pool in self.ctx.registry.pools(scan.chain) {
                let Some(snapshot) = snapshots.get(&(scan.chain, pool.address)) else {
                    continue;
                };
                for (i, token_in) in pool.tokens.iter().enumerate() {
                    for (j, token_out) in pool.tokens.iter().enumerate() {
                        if i == j {
                            continue;
                        }
                        let forward =
                            self.pricer.spot_rate(pool, snapshot, *token_in, *token_out);
                        let back = self.pricer.spot_rate(pool, snapshot, *token_out, *token_in);
                        let (Some(forward), Some(back)) = (forward, back) else {
                            continue;
                        };
                        // Corrupt state shows up as a free round trip.
                        if forward * back > MAX_ROUND_TRIP_PRODUCT {
                            warn!(pool = %pool.address, "round-trip rate above 1, skipping pool");
                            continue;
                        }

                        let usd_in = self
                            .ctx
                            .registry
                            .token(scan.chain, *token_in)
                            .and_then(|t| graph::usd_of(prices, &t.canonical));
                        let usd_out = self
                            .ctx
                            .registry
                            .token(scan.chain, *token_out)
                            .and_then(|t| graph::usd_of(prices, &t.canonical));
                        let Some(advantage) = TokenGraph::advantage_of(forward, usd_in, usd_out)
                        else {
                            continue;
                        };
                        token_graph.add_swap_edge(
                            scan.chain,
                            pool.address,
                            *token_in,
                            *token_out,
                            forward,
                            advantage,
                        );
                    }
                }
            }
        }

        let scanned: HashSet<ChainId> = scans.iter().map(|s| s.chain).collect();
        for chain in &scanned {
            for lane in self.ctx.registry.bridges_from(*chain) {
                if !scanned.contains(&lane.chain_to) {
                    continue;
                }
                let from = self
                    .ctx
                    .registry
                    .equivalent_on(&lane.canonical, lane.chain_from);
                let to = self.ctx.registry.equivalent_on(&lane.canonical, lane.chain_to);
                if let (Some(from), Some(to)) = (from, to) {
                    token_graph.add_bridge_edge(lane.clone(), from.address, to.address);
                }
            }
        }

        token_graph
    }

    /// Enumerate and size candidates on the blocking pool.
    async fn evaluate_candidates(
        &self,
        token_graph: TokenGraph,
        snapshots: HashMap<(ChainId, alloy::primitives::Address), Arc<PoolSnapshot>>,
        fee_by_chain: HashMap<ChainId, FeeData>,
        prices: PriceSet,
    ) -> Vec<Opportunity> {
        let permit = match Arc::clone(&self.eval_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Vec::new(),
        };

        let registry = Arc::clone(&self.ctx.registry);
        let pricer = Arc::clone(&self.pricer);
        let profit = Arc::clone(&self.profit);
        let clock = Arc::clone(&self.ctx.clock);
        let settings = Arc::clone(&self.ctx.settings);

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let evaluator = CycleEvaluator {
                registry: &registry,
                pricer: &pricer,
                profit: &profit,
                snapshots: &snapshots,
                fee_by_chain: &fee_by_chain,
                prices: &prices,
                now: clock.now(),
                min_notional_usd: settings.min_notional_usd,
                probe_points: settings.probe_points,
                max_depth_share: Decimal::new(settings.max_depth_share_bps as i64, 4),
                preferred_provider: settings.flash_loan_provider.clone(),
            };
            let found = cycles::enumerate(&token_graph, &registry, settings.max_hops);
            debug!(cycles = found.len(), "cycle enumeration complete");
            found
                .into_iter()
                .filter_map(|cycle| evaluator.best_opportunity(&cycle))
                .collect::<Vec<_>>()
        })
        .await;

        result.unwrap_or_default()
    }

    /// Freshness-check survivors against current heads and emit them in
    /// order. Emission stops on bus backpressure.
    async fn emit_signals(&self, survivors: Vec<Opportunity>) -> usize {
        if survivors.is_empty() {
            return 0;
        }

        // Re-read heads once; a signal is dropped if any of its source
        // blocks has fallen behind the freshness window by build time.
        let mut heads: HashMap<ChainId, u64> = HashMap::new();
        for chain in self.ctx.registry.chain_ids() {
            if let Some(client) = self.ctx.chains.get(chain) {
                if let Ok(head) = client.block_number().await {
                    heads.insert(chain, head);
                }
            }
        }

        let now = self.ctx.clock.now();
        let ttl = chrono::Duration::from_std(self.ctx.settings.signal_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let mut emitted = 0usize;

        for opportunity in survivors {
            let fresh = opportunity.route.source_blocks.iter().all(|(chain, block)| {
                heads
                    .get(chain)
                    .map(|head| head.saturating_sub(*block) <= self.ctx.settings.freshness_blocks)
                    .unwrap_or(false)
            });
            if !fresh {
                debug!("dropping stale candidate before emission");
                continue;
            }

            let provider = match self
                .ctx
                .registry
                .preferred_provider(opportunity.route.chain, &self.ctx.settings.flash_loan_provider)
            {
                Some(provider) => provider.id.clone(),
                // Flash-loan funding is mandatory; never emit self-funded.
                None => continue,
            };

            let signal = Signal {
                version: SIGNAL_VERSION,
                id: Uuid::new_v4(),
                created_at: now,
                expires_at: now + ttl,
                flash_loan_provider: provider,
                mev_policy: self.ctx.settings.mev_policy,
                opportunity,
            };

            match self.ctx.bus.emit(&signal).await {
                Ok(()) => {
                    emitted += 1;
                    Metrics::incr(&self.ctx.metrics.signals_emitted);
                    info!(
                        signal = %signal.id,
                        net_profit = %signal.opportunity.net_profit_usd,
                        "signal emitted"
                    );
                }
                Err(err) => {
                    Metrics::incr(&self.ctx.metrics.bus_errors);
                    warn!(%err, "bus unavailable, pausing emission this tick");
                    break;
                }
            }
        }
        emitted
    }
}

fn index_snapshots(
    scans: &[ChainScan],
) -> HashMap<(ChainId, alloy::primitives::Address), Arc<PoolSnapshot>> {
    let mut map = HashMap::new();
    for scan in scans {
        for snapshot in &scan.snapshots {
            map.insert((scan.chain, snapshot.pool), Arc::clone(snapshot));
        }
    }
    map
}

/// Synchronous sizing and evaluation of one enumerated cycle.
struct CycleEvaluator<'a> {
    registry: &'a Arc<Registry>,
    pricer: &'a Pricer,
    profit: &'a ProfitEngine,
    snapshots: &'a HashMap<(ChainId, alloy::primitives::Address), Arc<PoolSnapshot>>,
    fee_by_chain: &'a HashMap<ChainId, FeeData>,
    prices: &'a PriceSet,
    now: chrono::DateTime<chrono::Utc>,
    min_notional_usd: Decimal,
    probe_points: u32,
    max_depth_share: Decimal,
    preferred_provider: String,
}

impl CycleEvaluator<'_> {
    /// Probe a geometric amount sweep and keep the input that maximizes net
    /// profit. Returns nothing when every probe fails a guard.
    fn best_opportunity(&self, cycle: &Cycle) -> Option<Opportunity> {
        let (chain, token_in) = cycle.start;
        let provider = self.registry.preferred_provider(chain, &self.preferred_provider)?;
        let fee_data = self.fee_by_chain.get(&chain)?;

        let token = self.registry.token(chain, token_in)?;
        let usd_in = self.prices.get(&token.canonical)?.price;
        if usd_in <= Decimal::ZERO {
            return None;
        }
        let min_amount = self.min_notional_usd / usd_in;
        let max_amount = self.first_hop_depth_cap(cycle)?;
        if max_amount <= min_amount {
            return None;
        }

        let gas_units = gas_estimate(cycle);
        let mut best: Option<Opportunity> = None;
        for amount in geometric_sweep(min_amount, max_amount, self.probe_points) {
            let route = match self.build_route(cycle, amount) {
                Ok(route) => route,
                Err(reason) => {
                    tracing::trace!(%reason, "probe amount unusable");
                    continue;
                }
            };
            let confidence = confidence_for(&route, self.fee_by_chain);
            match self.profit.evaluate(
                route,
                provider,
                gas_units,
                fee_data.gas_price,
                self.prices,
                confidence,
            ) {
                Ok(candidate) => {
                    if best
                        .as_ref()
                        .map(|b| candidate.net_profit_usd > b.net_profit_usd)
                        .unwrap_or(true)
                    {
                        best = Some(candidate);
                    }
                }
                Err(rejection) => tracing::trace!(?rejection, "probe rejected"),
            }
        }
        best
    }

    /// Sizing ceiling: the configured share of the first hop's input depth.
    /// Later hops enforce their own share inside `build_route`.
    fn first_hop_depth_cap(&self, cycle: &Cycle) -> Option<Decimal> {
        let first = cycle.edges.first()?;
        match &first.kind {
            EdgeKind::Swap { pool, chain } => {
                let pool = self.registry.pool(*chain, *pool)?;
                let snapshot = self.snapshots.get(&(*chain, pool.address))?;
                let depth = self.pricer.available_depth(pool, snapshot, first.token_in.1)?;
                Some(depth * self.max_depth_share)
            }
            // Bridge-first routes are sized by the first swap after it.
            EdgeKind::Bridge { .. } => cycle
                .edges
                .iter()
                .find_map(|e| match &e.kind {
                    EdgeKind::Swap { pool, chain } => {
                        let pool = self.registry.pool(*chain, *pool)?;
                        let snapshot = self.snapshots.get(&(*chain, pool.address))?;
                        let depth =
                            self.pricer.available_depth(pool, snapshot, e.token_in.1)?;
                        Some(depth * self.max_depth_share)
                    }
                    EdgeKind::Bridge { .. } => None,
                }),
        }
    }

    /// Chain quotes along the cycle for a concrete input amount.
    fn build_route(&self, cycle: &Cycle, amount_in: Decimal) -> Result<Route, QuoteReason> {
        let mut amount = amount_in;
        let mut hops = Vec::with_capacity(cycle.edges.len());
        let mut source_blocks = BTreeMap::new();

        for edge in &cycle.edges {
            match &edge.kind {
                EdgeKind::Swap { pool, chain } => {
                    let pool = self
                        .registry
                        .pool(*chain, *pool)
                        .ok_or(QuoteReason::StateUnavailable)?;
                    let snapshot = self
                        .snapshots
                        .get(&(*chain, pool.address))
                        .ok_or(QuoteReason::StateUnavailable)?;
                    let quote = self.pricer.quote(
                        pool,
                        snapshot,
                        edge.token_in.1,
                        edge.token_out.1,
                        amount,
                        self.now,
                    )?;
                    if quote.depth_used > self.max_depth_share {
                        return Err(QuoteReason::InsufficientLiquidity);
                    }
                    amount = quote.amount_out;
                    source_blocks.insert(*chain, snapshot.block);
                    hops.push(Hop::Swap(quote));
                }
                EdgeKind::Bridge { lane } => {
                    let fee = amount * Decimal::new(lane.fee_bps as i64, 4);
                    let out = amount - fee;
                    hops.push(Hop::Bridge(BridgeQuote {
                        provider: lane.provider.clone(),
                        chain_from: lane.chain_from,
                        chain_to: lane.chain_to,
                        canonical: lane.canonical.clone(),
                        amount_in: amount,
                        amount_out: out,
                        fee,
                    }));
                    amount = out;
                }
            }
        }

        Ok(Route {
            hops,
            chain: cycle.start.0,
            token_in: cycle.start.1,
            source_blocks,
        })
    }
}

fn gas_estimate(cycle: &Cycle) -> u64 {
    let mut gas = GAS_FLASH_OVERHEAD;
    for edge in &cycle.edges {
        gas += match edge.kind {
            EdgeKind::Swap { .. } => GAS_PER_SWAP_HOP,
            EdgeKind::Bridge { .. } => GAS_PER_BRIDGE_HOP,
        };
    }
    gas
}

fn confidence_for(route: &Route, fee_by_chain: &HashMap<ChainId, FeeData>) -> Confidence {
    if route.source_blocks.keys().all(|c| fee_by_chain.contains_key(c)) {
        Confidence::High
    } else {
        Confidence::Low
    }
}

/// Geometric sweep of `points` trade sizes between the two bounds.
fn geometric_sweep(min: Decimal, max: Decimal, points: u32) -> Vec<Decimal> {
    if points <= 1 || min >= max {
        return vec![min];
    }
    let ratio = max / min;
    let step_exponent = Decimal::ONE / Decimal::from(points - 1);
    let Some(step) = ratio.checked_powd(step_exponent) else {
        return vec![min, max];
    };
    let mut amounts = Vec::with_capacity(points as usize);
    let mut amount = min;
    for _ in 0..points - 1 {
        amounts.push(amount);
        amount *= step;
    }
    amounts.push(max);
    amounts
}
