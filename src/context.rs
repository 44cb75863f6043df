//! Shared core context
//!
//! Explicit construction instead of module-level singletons: every component
//! receives the collaborators it needs through `CoreContext`. The clock is
//! injected so freshness and expiry logic is testable.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::bus::SignalBus;
use crate::chain::ChainClientPool;
use crate::config::Settings;
use crate::metrics::Metrics;
use crate::oracle::UsdOracle;
use crate::registry::Registry;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything the pipeline components share. Cheap to clone.
#[derive(Clone)]
pub struct CoreContext {
    pub settings: Arc<Settings>,
    pub registry: Arc<Registry>,
    pub chains: Arc<ChainClientPool>,
    pub bus: Arc<dyn SignalBus>,
    pub oracle: Arc<dyn UsdOracle>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
}
