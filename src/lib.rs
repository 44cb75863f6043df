//! Multi-chain flash-loan DEX arbitrage engine
//!
//! The off-chain decision pipeline: chain clients with failover, a token
//! and pool registry, decimal-exact pricing and profit evaluation, a
//! graph-based opportunity scanner, an at-most-once signal bus, and an
//! execution engine wrapped in its safety envelope, all supervised by a
//! circuit breaker.

pub mod bus;
pub mod chain;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod oracle;
pub mod pricer;
pub mod profit;
pub mod registry;
pub mod scanner;
pub mod supervisor;
pub mod types;

#[cfg(test)]
pub mod testutil;
