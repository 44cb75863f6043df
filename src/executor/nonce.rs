//! Per-chain nonce manager
//!
//! The only entity allowed to pick nonces for a signing key on a chain.
//! Resyncs from the node's pending nonce on first use and after any
//! conflict; the owning engine serializes submissions per chain, so the
//! lock here is held only around the counter, never across I/O.

use alloy::primitives::Address;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::chain::ChainClient;
use crate::errors::EngineError;
use crate::types::ChainId;

pub struct NonceManager {
    chain: ChainId,
    address: Address,
    next: Mutex<Option<u64>>,
}

impl NonceManager {
    pub fn new(chain: ChainId, address: Address) -> Self {
        Self {
            chain,
            address,
            next: Mutex::new(None),
        }
    }

    /// Reserve the next nonce, fetching the node's pending nonce on first
    /// use after boot or a resync.
    pub async fn reserve(&self, client: &Arc<ChainClient>) -> Result<u64, EngineError> {
        {
            let mut next = self.next.lock();
            if let Some(n) = *next {
                *next = Some(n + 1);
                return Ok(n);
            }
        }
        let pending = client.pending_nonce(self.address).await?;
        *self.next.lock() = Some(pending + 1);
        Ok(pending)
    }

    /// Drop local state; the next reserve re-reads the node.
    pub async fn resync(&self, client: &Arc<ChainClient>) -> Result<u64, EngineError> {
        *self.next.lock() = None;
        let pending = client.pending_nonce(self.address).await?;
        *self.next.lock() = Some(pending);
        Ok(pending)
    }

    /// A submission with `nonce` failed before reaching the mempool; make
    /// the nonce reusable so the sequence stays gapless.
    pub fn release(&self, nonce: u64) {
        let mut next = self.next.lock();
        if *next == Some(nonce + 1) {
            *next = Some(nonce);
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }
}
