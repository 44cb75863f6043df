//! RPC endpoint seam and per-endpoint health tracking
//!
//! `RpcEndpoint` is the trait boundary the rest of the engine sees; the
//! production implementation wraps an alloy HTTP provider. Health records
//! drive failover ordering: healthy first, then lowest EWMA latency.

use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::errors::EngineError;
use crate::types::FeeData;

/// Probe failures before an endpoint is marked unhealthy.
const PROBE_FAILURE_LIMIT: u32 = 3;

/// Backoff bounds for retrying an unhealthy endpoint.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Smoothing factor for the latency EWMA (non-monetary, float is fine).
const LATENCY_ALPHA: f64 = 0.3;

/// Minimal receipt view the engine needs for confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub status: bool,
    pub block_number: u64,
    pub gas_used: u64,
}

/// One JSON-RPC endpoint. Implementations must apply their own deadline and
/// surface `Timeout` so the pool can treat it as an endpoint failure.
#[async_trait]
pub trait RpcEndpoint: Send + Sync {
    fn url(&self) -> &str;
    async fn block_number(&self) -> Result<u64, EngineError>;
    async fn chain_id(&self) -> Result<u64, EngineError>;
    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, EngineError>;
    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, EngineError>;
    async fn fee_data(&self) -> Result<FeeData, EngineError>;
    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<B256, EngineError>;
    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError>;
    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptSummary>, EngineError>;
}

/// Production endpoint backed by an alloy HTTP provider.
pub struct HttpEndpoint {
    url: String,
    provider: RootProvider,
    timeout: Duration,
}

impl HttpEndpoint {
    pub fn connect(url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let parsed = url
            .parse()
            .map_err(|e| EngineError::ConfigInvalid(format!("rpc url '{url}': {e}")))?;
        Ok(Self {
            url: url.to_string(),
            provider: ProviderBuilder::new().connect_http(parsed).root().clone(),
            timeout,
        })
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: std::future::Future<Output = Result<T, EngineError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl RpcEndpoint for HttpEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        self.with_deadline(async {
            self.provider
                .get_block_number()
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))
        })
        .await
    }

    async fn chain_id(&self) -> Result<u64, EngineError> {
        self.with_deadline(async {
            self.provider
                .get_chain_id()
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))
        })
        .await
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, EngineError> {
        self.with_deadline(async {
            self.provider
                .call(tx)
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))
        })
        .await
    }

    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, EngineError> {
        self.with_deadline(async {
            self.provider
                .estimate_gas(tx)
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))
        })
        .await
    }

    async fn fee_data(&self) -> Result<FeeData, EngineError> {
        self.with_deadline(async {
            let gas_price = self
                .provider
                .get_gas_price()
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))?;
            let estimate = self
                .provider
                .estimate_eip1559_fees()
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))?;
            Ok(FeeData {
                base_fee_per_gas: gas_price.saturating_sub(estimate.max_priority_fee_per_gas),
                max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
                gas_price,
            })
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<B256, EngineError> {
        self.with_deadline(async {
            let pending = self
                .provider
                .send_raw_transaction(&raw)
                .await
                .map_err(|e| EngineError::SubmissionRejected(e.to_string()))?;
            Ok(*pending.tx_hash())
        })
        .await
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
        self.with_deadline(async {
            self.provider
                .get_transaction_count(address)
                .pending()
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))
        })
        .await
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptSummary>, EngineError> {
        self.with_deadline(async {
            let receipt = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| EngineError::Rpc(e.to_string()))?;
            Ok(receipt.map(|r| ReceiptSummary {
                status: r.status(),
                block_number: r.block_number.unwrap_or_default(),
                gas_used: r.gas_used,
            }))
        })
        .await
    }
}

/// Mutable health state for one endpoint. Guarded by a fine-grained lock in
/// the chain client; never held across I/O.
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub consecutive_failures: u32,
    pub probe_failures: u32,
    pub latency_ewma_ms: f64,
    pub last_success: Option<Instant>,
    pub unhealthy: bool,
    backoff: Duration,
    next_retry: Option<Instant>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            probe_failures: 0,
            latency_ewma_ms: 0.0,
            last_success: None,
            unhealthy: false,
            backoff: BACKOFF_INITIAL,
            next_retry: None,
        }
    }
}

impl EndpointHealth {
    pub fn record_success(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1_000.0;
        self.latency_ewma_ms = if self.last_success.is_none() {
            ms
        } else {
            LATENCY_ALPHA * ms + (1.0 - LATENCY_ALPHA) * self.latency_ewma_ms
        };
        self.consecutive_failures = 0;
        self.probe_failures = 0;
        self.last_success = Some(Instant::now());
        self.unhealthy = false;
        self.backoff = BACKOFF_INITIAL;
        self.next_retry = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Probe failures escalate to unhealthy with capped exponential backoff.
    pub fn record_probe_failure(&mut self) {
        self.probe_failures += 1;
        if self.probe_failures >= PROBE_FAILURE_LIMIT {
            self.unhealthy = true;
            self.next_retry = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Whether operations should try this endpoint right now.
    pub fn usable(&self, now: Instant) -> bool {
        if !self.unhealthy {
            return true;
        }
        self.next_retry.map(|at| now >= at).unwrap_or(true)
    }

    /// Sort key for failover ordering: healthy first, then lowest latency.
    pub fn order_key(&self) -> (bool, u64) {
        (self.unhealthy, self.latency_ewma_ms as u64)
    }
}
