//! Metrics surface
//!
//! Plain atomic counters plus an immutable snapshot for collaborators.
//! Read-only to everyone except the owning components; floats are fine here,
//! nothing monetary passes through.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Engine-wide counters. One instance per process, shared via `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub scan_ticks: AtomicU64,
    pub last_tick_ms: AtomicU64,
    pub opportunities_found: AtomicU64,
    pub signals_emitted: AtomicU64,
    pub signals_consumed: AtomicU64,
    pub signals_expired: AtomicU64,

    pub exec_validated: AtomicU64,
    pub exec_simulated: AtomicU64,
    pub exec_submitted: AtomicU64,
    pub exec_confirmed: AtomicU64,
    pub exec_reverted: AtomicU64,
    pub exec_rejected: AtomicU64,

    pub breaker_open: AtomicBool,
    pub breaker_trips: AtomicU64,
    /// Scanner interval currently in force (ms), for observability.
    pub scan_interval_ms: AtomicU64,

    pub bus_errors: AtomicU64,
    pub rpc_failovers: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scan_ticks: self.scan_ticks.load(Ordering::Relaxed),
            last_tick_ms: self.last_tick_ms.load(Ordering::Relaxed),
            opportunities_found: self.opportunities_found.load(Ordering::Relaxed),
            signals_emitted: self.signals_emitted.load(Ordering::Relaxed),
            signals_consumed: self.signals_consumed.load(Ordering::Relaxed),
            signals_expired: self.signals_expired.load(Ordering::Relaxed),
            exec_validated: self.exec_validated.load(Ordering::Relaxed),
            exec_simulated: self.exec_simulated.load(Ordering::Relaxed),
            exec_submitted: self.exec_submitted.load(Ordering::Relaxed),
            exec_confirmed: self.exec_confirmed.load(Ordering::Relaxed),
            exec_reverted: self.exec_reverted.load(Ordering::Relaxed),
            exec_rejected: self.exec_rejected.load(Ordering::Relaxed),
            breaker_open: self.breaker_open.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            scan_interval_ms: self.scan_interval_ms.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            rpc_failovers: self.rpc_failovers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub scan_ticks: u64,
    pub last_tick_ms: u64,
    pub opportunities_found: u64,
    pub signals_emitted: u64,
    pub signals_consumed: u64,
    pub signals_expired: u64,
    pub exec_validated: u64,
    pub exec_simulated: u64,
    pub exec_submitted: u64,
    pub exec_confirmed: u64,
    pub exec_reverted: u64,
    pub exec_rejected: u64,
    pub breaker_open: bool,
    pub breaker_trips: u64,
    pub scan_interval_ms: u64,
    pub bus_errors: u64,
    pub rpc_failovers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.signals_emitted);
        Metrics::incr(&metrics.signals_emitted);
        metrics.breaker_open.store(true, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.signals_emitted, 2);
        assert!(snap.breaker_open);
        assert_eq!(snap.exec_confirmed, 0);
    }
}
