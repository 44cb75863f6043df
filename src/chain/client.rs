//! Failover chain client
//!
//! One client per chain, holding its RPC endpoints in priority order. Every
//! operation walks the endpoints ordered by (healthy first, lowest latency),
//! records the outcome, and fails with `AllEndpointsDown` only when no
//! endpoint answered. Concurrent callers are served in parallel; the only
//! shared state is the per-endpoint health record behind a fine-grained lock.

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::sol;
use alloy::sol_types::SolCall;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::endpoint::{EndpointHealth, ReceiptSummary, RpcEndpoint};
use crate::errors::EngineError;
use crate::metrics::Metrics;
use crate::types::{ChainId, FeeData};

// Multicall3 is deployed at the same address on most EVM chains; the
// registry decides per chain whether batch aggregation is available.
sol! {
    /// Multicall3 interface for batched read calls.
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls)
            external payable
            returns (Result[] memory returnData);
    }
}

struct ManagedEndpoint {
    endpoint: Arc<dyn RpcEndpoint>,
    health: Mutex<EndpointHealth>,
}

/// Read-only health view for the metrics surface.
#[derive(Debug, Clone)]
pub struct EndpointHealthSnapshot {
    pub chain: ChainId,
    pub url: String,
    pub healthy: bool,
    pub latency_ewma_ms: f64,
    pub consecutive_failures: u32,
}

/// Failover-capable RPC access for a single chain.
pub struct ChainClient {
    pub chain: ChainId,
    pub name: String,
    endpoints: Vec<ManagedEndpoint>,
    /// Optional private relay; submit-only, tracked separately.
    relay: Option<ManagedEndpoint>,
    multicall: Option<Address>,
    metrics: Arc<Metrics>,
}

impl ChainClient {
    pub fn new(
        chain: ChainId,
        name: String,
        endpoints: Vec<Arc<dyn RpcEndpoint>>,
        relay: Option<Arc<dyn RpcEndpoint>>,
        multicall: Option<Address>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            chain,
            name,
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| ManagedEndpoint {
                    endpoint,
                    health: Mutex::new(EndpointHealth::default()),
                })
                .collect(),
            relay: relay.map(|endpoint| ManagedEndpoint {
                endpoint,
                health: Mutex::new(EndpointHealth::default()),
            }),
            multicall,
            metrics,
        }
    }

    /// Endpoint indices in try order: usable first, healthy before
    /// unhealthy-but-retryable, lowest EWMA latency first. Ties keep the
    /// configured priority order.
    fn try_order(&self) -> Vec<usize> {
        let now = Instant::now();
        let mut order: Vec<(usize, (bool, u64))> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, m)| m.health.lock().usable(now))
            .map(|(i, m)| (i, m.health.lock().order_key()))
            .collect();
        order.sort_by_key(|(i, key)| (*key, *i));
        order.into_iter().map(|(i, _)| i).collect()
    }

    async fn with_failover<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        F: Fn(Arc<dyn RpcEndpoint>) -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let order = self.try_order();
        let mut tried = 0usize;
        for index in order {
            let managed = &self.endpoints[index];
            let started = Instant::now();
            tried += 1;
            match f(Arc::clone(&managed.endpoint)).await {
                Ok(value) => {
                    managed.health.lock().record_success(started.elapsed());
                    if tried > 1 {
                        Metrics::incr(&self.metrics.rpc_failovers);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    managed.health.lock().record_failure();
                    debug!(
                        chain = self.chain,
                        endpoint = managed.endpoint.url(),
                        %err,
                        "rpc {op} failed, advancing to next endpoint"
                    );
                }
            }
        }
        warn!(chain = self.chain, op, "all endpoints down");
        Err(EngineError::AllEndpointsDown { chain: self.chain })
    }

    pub async fn block_number(&self) -> Result<u64, EngineError> {
        self.with_failover("block_number", |e| async move { e.block_number().await })
            .await
    }

    pub async fn call(&self, tx: TransactionRequest) -> Result<Bytes, EngineError> {
        self.with_failover("call", move |e| {
            let tx = tx.clone();
            async move { e.call(tx).await }
        })
        .await
    }

    pub async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, EngineError> {
        self.with_failover("estimate_gas", move |e| {
            let tx = tx.clone();
            async move { e.estimate_gas(tx).await }
        })
        .await
    }

    pub async fn fee_data(&self) -> Result<FeeData, EngineError> {
        self.with_failover("fee_data", |e| async move { e.fee_data().await }).await
    }

    pub async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<B256, EngineError> {
        self.with_failover("send_raw_transaction", move |e| {
            let raw = raw.clone();
            async move { e.send_raw_transaction(raw).await }
        })
        .await
    }

    pub async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
        self.with_failover("pending_nonce", move |e| async move {
            e.pending_nonce(address).await
        })
        .await
    }

    pub async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptSummary>, EngineError> {
        self.with_failover("receipt", move |e| async move { e.receipt(tx_hash).await })
            .await
    }

    /// Submit through the private relay. No failover to public endpoints;
    /// the caller decides what an unreachable relay means.
    pub async fn send_raw_private(&self, raw: Vec<u8>) -> Result<B256, EngineError> {
        let managed = self
            .relay
            .as_ref()
            .ok_or_else(|| EngineError::SubmissionRejected("no private relay configured".into()))?;
        let started = Instant::now();
        match managed.endpoint.send_raw_transaction(raw).await {
            Ok(hash) => {
                managed.health.lock().record_success(started.elapsed());
                Ok(hash)
            }
            Err(err) => {
                managed.health.lock().record_failure();
                Err(err)
            }
        }
    }

    pub fn relay_healthy(&self) -> bool {
        self.relay
            .as_ref()
            .map(|m| m.health.lock().usable(Instant::now()))
            .unwrap_or(false)
    }

    /// Batched read calls: one Multicall3 aggregate where available,
    /// concurrent individual calls otherwise. `None` entries are calls that
    /// failed without sinking the batch.
    pub async fn batch_call(
        &self,
        calls: Vec<(Address, Bytes)>,
    ) -> Result<Vec<Option<Bytes>>, EngineError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(multicall) = self.multicall {
            let aggregated = IMulticall3::aggregate3Call {
                calls: calls
                    .iter()
                    .map(|(target, data)| IMulticall3::Call3 {
                        target: *target,
                        allowFailure: true,
                        callData: data.clone(),
                    })
                    .collect(),
            };
            let tx = TransactionRequest::default()
                .to(multicall)
                .input(TransactionInput::new(Bytes::from(aggregated.abi_encode())));
            let raw = self.call(tx).await?;
            let decoded = IMulticall3::aggregate3Call::abi_decode_returns(&raw)
                .map_err(|e| EngineError::Rpc(format!("multicall decode: {e}")))?;
            return Ok(decoded
                .into_iter()
                .map(|r| r.success.then_some(r.returnData))
                .collect());
        }

        let futures = calls.into_iter().map(|(target, data)| {
            let tx = TransactionRequest::default()
                .to(target)
                .input(TransactionInput::new(data));
            async move { self.call(tx).await.ok() }
        });
        Ok(futures::future::join_all(futures).await)
    }

    /// Background probe pass: one `block_number` per endpoint, bypassing
    /// failover so each endpoint's health is judged on its own.
    pub async fn probe_once(&self) {
        for managed in &self.endpoints {
            let started = Instant::now();
            match managed.endpoint.block_number().await {
                Ok(_) => managed.health.lock().record_success(started.elapsed()),
                Err(err) => {
                    let mut health = managed.health.lock();
                    health.record_probe_failure();
                    debug!(
                        chain = self.chain,
                        endpoint = managed.endpoint.url(),
                        failures = health.probe_failures,
                        %err,
                        "health probe failed"
                    );
                }
            }
        }
    }

    /// Verify the node actually serves the configured chain.
    pub async fn verify_chain_id(&self) -> Result<(), EngineError> {
        let reported = self
            .with_failover("chain_id", |e| async move { e.chain_id().await })
            .await?;
        if reported != self.chain {
            return Err(EngineError::ConfigInvalid(format!(
                "chain '{}' configured as id {} but node reports {reported}",
                self.name, self.chain
            )));
        }
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        let now = Instant::now();
        self.endpoints.iter().any(|m| {
            let health = m.health.lock();
            !health.unhealthy || health.usable(now)
        })
    }

    pub fn health_snapshot(&self) -> Vec<EndpointHealthSnapshot> {
        self.endpoints
            .iter()
            .map(|m| {
                let health = m.health.lock();
                EndpointHealthSnapshot {
                    chain: self.chain,
                    url: m.endpoint.url().to_string(),
                    healthy: !health.unhealthy,
                    latency_ewma_ms: health.latency_ewma_ms,
                    consecutive_failures: health.consecutive_failures,
                }
            })
            .collect()
    }

    /// Force-fail an endpoint's probes. Test hook for failover scenarios.
    #[cfg(test)]
    pub fn poison_endpoint(&self, index: usize) {
        let mut health = self.endpoints[index].health.lock();
        for _ in 0..3 {
            health.record_probe_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockEndpoint;

    fn client(endpoints: Vec<Arc<dyn RpcEndpoint>>) -> ChainClient {
        ChainClient::new(1, "testnet".into(), endpoints, None, None, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn operation_fails_over_to_second_endpoint() {
        let bad = MockEndpoint::new("http://bad").failing();
        let good = MockEndpoint::new("http://good").with_block(123);
        let client = client(vec![Arc::new(bad), Arc::new(good)]);

        let block = client.block_number().await.unwrap();
        assert_eq!(block, 123);

        let snapshot = client.health_snapshot();
        assert_eq!(snapshot[0].consecutive_failures, 1);
        assert_eq!(snapshot[1].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn all_endpoints_down_surfaces_typed_error() {
        let client = client(vec![
            Arc::new(MockEndpoint::new("http://a").failing()),
            Arc::new(MockEndpoint::new("http://b").failing()),
        ]);
        match client.block_number().await {
            Err(EngineError::AllEndpointsDown { chain: 1 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unhealthy_endpoint_skipped_until_backoff_elapses() {
        let first = MockEndpoint::new("http://first").with_block(5);
        let second = MockEndpoint::new("http://second").with_block(9);
        let client = client(vec![Arc::new(first), Arc::new(second)]);

        client.poison_endpoint(0);
        // Endpoint 0 is unhealthy and inside backoff, so the call must land
        // on endpoint 1.
        let block = client.block_number().await.unwrap();
        assert_eq!(block, 9);
    }

    #[tokio::test]
    async fn probe_marks_endpoint_unhealthy_after_three_failures() {
        let flaky = MockEndpoint::new("http://flaky").failing();
        let good = MockEndpoint::new("http://good").with_block(77);
        let client = client(vec![Arc::new(flaky), Arc::new(good)]);

        for _ in 0..3 {
            client.probe_once().await;
        }
        let snapshot = client.health_snapshot();
        assert!(!snapshot[0].healthy);
        assert!(snapshot[1].healthy);

        // Subsequent operations prefer the healthy endpoint.
        assert_eq!(client.block_number().await.unwrap(), 77);
    }

    #[tokio::test]
    async fn batch_call_without_multicall_runs_individually() {
        let endpoint = MockEndpoint::new("http://node")
            .with_block(1)
            .with_call_result(Bytes::from(vec![0xAA]));
        let client = client(vec![Arc::new(endpoint)]);

        let results = client
            .batch_call(vec![
                (Address::repeat_byte(1), Bytes::new()),
                (Address::repeat_byte(2), Bytes::new()),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_some()));
    }
}
