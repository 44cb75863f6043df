//! Supervisor
//!
//! Owns the circuit breaker and the periodic health probes, and logs the
//! metrics surface. The breaker never stops the process; it stretches the
//! scanner interval and holds submissions until a fresh passing simulation
//! proves the pipeline healthy again.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::context::CoreContext;
use crate::metrics::Metrics;

/// Scanner backoff cap under a tripped breaker.
const MAX_INTERVAL_MS: u64 = 30_000;

/// Rolling consecutive-failure breaker.
///
/// Trips at the configured threshold: doubles the scanner interval (capped),
/// holds submissions, and requests a probe cycle. Consecutive trips keep
/// doubling. A successful execution halves the interval back toward
/// baseline; a passing simulation releases the submission hold.
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
    baseline_interval_ms: u64,
    /// Shared with the scanner, which re-reads it every tick.
    interval_ms: Arc<AtomicU64>,
    holding: AtomicBool,
    trips: AtomicU64,
    probe_request: Notify,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, baseline_interval_ms: u64, metrics: Arc<Metrics>) -> Self {
        let interval_ms = Arc::new(AtomicU64::new(baseline_interval_ms));
        metrics
            .scan_interval_ms
            .store(baseline_interval_ms, Ordering::Relaxed);
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
            baseline_interval_ms,
            interval_ms,
            holding: AtomicBool::new(false),
            trips: AtomicU64::new(0),
            probe_request: Notify::new(),
            metrics,
        }
    }

    /// Handle the scanner reads its tick interval from.
    pub fn interval_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.interval_ms)
    }

    pub fn is_holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// An infrastructure failure (revert, simulation revert, chain down).
    pub fn record_failure(&self) {
        let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.threshold == 0 {
            let current = self.interval_ms.load(Ordering::SeqCst);
            let doubled = (current * 2).min(MAX_INTERVAL_MS);
            self.interval_ms.store(doubled, Ordering::SeqCst);
            self.holding.store(true, Ordering::SeqCst);
            self.trips.fetch_add(1, Ordering::SeqCst);
            Metrics::incr(&self.metrics.breaker_trips);
            self.metrics.breaker_open.store(true, Ordering::Relaxed);
            self.metrics.scan_interval_ms.store(doubled, Ordering::Relaxed);
            self.probe_request.notify_one();
            warn!(
                consecutive = count,
                interval_ms = doubled,
                "circuit breaker tripped: scanner slowed, submissions held"
            );
        }
    }

    /// A passing simulation proves the pipeline can produce valid
    /// transactions again; release held submissions.
    pub fn record_simulation_passed(&self) {
        if self.holding.swap(false, Ordering::SeqCst) {
            info!("circuit breaker released by passing simulation");
        }
    }

    /// A successful execution walks the interval back toward baseline.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.holding.store(false, Ordering::SeqCst);
        let current = self.interval_ms.load(Ordering::SeqCst);
        let halved = (current / 2).max(self.baseline_interval_ms);
        self.interval_ms.store(halved, Ordering::SeqCst);
        self.metrics.breaker_open.store(false, Ordering::Relaxed);
        self.metrics.scan_interval_ms.store(halved, Ordering::Relaxed);
    }

    pub fn current_interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::SeqCst)
    }

    async fn probe_requested(&self) {
        self.probe_request.notified().await;
    }
}

/// Lifecycle and health supervisor task.
pub struct Supervisor {
    ctx: CoreContext,
    breaker: Arc<CircuitBreaker>,
    expected_signer: alloy::primitives::Address,
}

impl Supervisor {
    pub fn new(
        ctx: CoreContext,
        breaker: Arc<CircuitBreaker>,
        expected_signer: alloy::primitives::Address,
    ) -> Self {
        Self {
            ctx,
            breaker,
            expected_signer,
        }
    }

    /// Periodic probes plus immediate probe cycles on breaker trips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.settings.probe_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_cycle().await;
                    self.log_metrics();
                }
                _ = self.breaker.probe_requested() => {
                    warn!("breaker trip: running immediate probe cycle");
                    self.probe_cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("supervisor stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every health surface.
    pub async fn probe_cycle(&self) {
        self.ctx.chains.probe_all().await;
        for snapshot in self.ctx.chains.health_snapshot() {
            if !snapshot.healthy {
                warn!(
                    chain = snapshot.chain,
                    endpoint = %snapshot.url,
                    failures = snapshot.consecutive_failures,
                    "endpoint unhealthy"
                );
            }
        }

        if let Err(err) = self.ctx.bus.probe().await {
            warn!(%err, "signal bus probe failed");
        }

        if let Err(err) = self.ctx.oracle.probe().await {
            warn!(%err, "oracle probe failed");
        }

        // Signing-key validity: the key must still derive the address the
        // engine submits from.
        match self.ctx.settings.private_key.parse::<alloy::signers::local::PrivateKeySigner>() {
            Ok(signer) if signer.address() == self.expected_signer => {}
            Ok(signer) => warn!(
                expected = %self.expected_signer,
                derived = %signer.address(),
                "signing key derives unexpected address"
            ),
            Err(err) => warn!(%err, "signing key no longer parses"),
        }
    }

    fn log_metrics(&self) {
        let snapshot = self.ctx.metrics.snapshot();
        info!(
            ticks = snapshot.scan_ticks,
            last_tick_ms = snapshot.last_tick_ms,
            opportunities = snapshot.opportunities_found,
            emitted = snapshot.signals_emitted,
            consumed = snapshot.signals_consumed,
            confirmed = snapshot.exec_confirmed,
            reverted = snapshot.exec_reverted,
            rejected = snapshot.exec_rejected,
            breaker_open = snapshot.breaker_open,
            interval_ms = snapshot.scan_interval_ms,
            "engine health"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, baseline: u64) -> CircuitBreaker {
        CircuitBreaker::new(threshold, baseline, Arc::new(Metrics::new()))
    }

    #[test]
    fn trips_exactly_at_threshold_and_doubles_interval() {
        let breaker = breaker(10, 1_000);
        for _ in 0..9 {
            breaker.record_failure();
        }
        assert!(!breaker.is_holding());
        assert_eq!(breaker.current_interval_ms(), 1_000);

        breaker.record_failure();
        assert!(breaker.is_holding());
        assert_eq!(breaker.current_interval_ms(), 2_000);
    }

    #[test]
    fn repeated_trips_double_up_to_cap() {
        let breaker = breaker(10, 1_000);
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.current_interval_ms(), 2_000);
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.current_interval_ms(), 4_000);

        // Keep failing: interval saturates at the cap and goes no further.
        for _ in 0..200 {
            breaker.record_failure();
        }
        assert_eq!(breaker.current_interval_ms(), MAX_INTERVAL_MS);
    }

    #[test]
    fn success_halves_back_toward_baseline() {
        let breaker = breaker(10, 1_000);
        for _ in 0..20 {
            breaker.record_failure();
        }
        assert_eq!(breaker.current_interval_ms(), 4_000);

        breaker.record_success();
        assert_eq!(breaker.current_interval_ms(), 2_000);
        assert!(!breaker.is_holding());
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.record_success();
        assert_eq!(breaker.current_interval_ms(), 1_000);
        breaker.record_success();
        // Never drops below baseline.
        assert_eq!(breaker.current_interval_ms(), 1_000);
    }

    #[test]
    fn passing_simulation_releases_hold_without_touching_interval() {
        let breaker = breaker(10, 1_000);
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert!(breaker.is_holding());

        breaker.record_simulation_passed();
        assert!(!breaker.is_holding());
        assert_eq!(breaker.current_interval_ms(), 2_000);
    }
}
