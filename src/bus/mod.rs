//! Signal Bus
//!
//! At-most-once delivery of trade signals, FIFO per producer. Two
//! realizations behind one trait: an in-process work queue and an
//! atomic-rename filesystem directory pair. Producers and consumers cannot
//! tell them apart.

pub mod fs;
pub mod queue;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{BusKind, Settings};
use crate::errors::EngineError;
use crate::types::Signal;

/// The bus contract.
///
/// `emit` succeeds only once the signal sits in a medium a consumer can
/// retrieve it from exactly once. `consume` atomically takes the next
/// signal; a taken signal is never redelivered, across restarts included.
#[async_trait]
pub trait SignalBus: Send + Sync {
    async fn emit(&self, signal: &Signal) -> Result<(), EngineError>;

    /// Next signal, or `None` when the bus is currently empty.
    async fn consume(&self) -> Result<Option<Signal>, EngineError>;

    /// Health probe for the supervisor.
    async fn probe(&self) -> Result<(), EngineError>;
}

/// Build the configured bus realization.
pub fn build(settings: &Settings) -> Result<Arc<dyn SignalBus>, EngineError> {
    Ok(match settings.bus_kind {
        BusKind::Queue => Arc::new(queue::QueueBus::new(1024)),
        BusKind::Fs => Arc::new(fs::FsBus::open(&settings.bus_dir)?),
    })
}
