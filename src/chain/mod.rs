//! Chain Client Pool
//!
//! Per-chain failover RPC access plus the background health probe loop.

pub mod client;
pub mod endpoint;

pub use client::{ChainClient, EndpointHealthSnapshot};
pub use endpoint::{EndpointHealth, HttpEndpoint, ReceiptSummary, RpcEndpoint};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::config::Settings;
use crate::errors::EngineError;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::types::ChainId;

/// All chain clients, keyed by chain id. Built once at startup.
pub struct ChainClientPool {
    clients: HashMap<ChainId, Arc<ChainClient>>,
    probe_interval: Duration,
}

impl ChainClientPool {
    /// Construct production clients from settings and registry metadata.
    pub fn connect(
        settings: &Settings,
        registry: &Registry,
        metrics: Arc<Metrics>,
    ) -> Result<Self, EngineError> {
        let mut clients = HashMap::new();
        for chain in &settings.chains {
            let mut endpoints: Vec<Arc<dyn RpcEndpoint>> = Vec::new();
            for url in &chain.rpc_urls {
                endpoints.push(Arc::new(HttpEndpoint::connect(url, settings.rpc_timeout)?));
            }
            let relay = match &chain.private_relay_url {
                Some(url) => Some(Arc::new(HttpEndpoint::connect(url, settings.rpc_timeout)?)
                    as Arc<dyn RpcEndpoint>),
                None => None,
            };
            let multicall = registry.chain(chain.chain_id).and_then(|meta| meta.multicall);

            clients.insert(
                chain.chain_id,
                Arc::new(ChainClient::new(
                    chain.chain_id,
                    chain.name.clone(),
                    endpoints,
                    relay,
                    multicall,
                    Arc::clone(&metrics),
                )),
            );
        }
        Ok(Self {
            clients,
            probe_interval: settings.probe_interval,
        })
    }

    /// Assemble a pool from pre-built clients (tests and tools).
    pub fn from_clients(clients: Vec<Arc<ChainClient>>, probe_interval: Duration) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.chain, c)).collect(),
            probe_interval,
        }
    }

    pub fn get(&self, chain: ChainId) -> Option<Arc<ChainClient>> {
        self.clients.get(&chain).cloned()
    }

    pub fn chains(&self) -> impl Iterator<Item = &Arc<ChainClient>> {
        self.clients.values()
    }

    pub fn is_available(&self, chain: ChainId) -> bool {
        self.clients.get(&chain).map(|c| c.is_available()).unwrap_or(false)
    }

    /// Startup check: every chain must answer with the configured chain id.
    pub async fn verify_all(&self) -> Result<(), EngineError> {
        for client in self.clients.values() {
            client.verify_chain_id().await?;
            info!(chain = client.chain, name = %client.name, "chain client verified");
        }
        Ok(())
    }

    /// One probe pass over every endpoint of every chain.
    pub async fn probe_all(&self) {
        for client in self.clients.values() {
            client.probe_once().await;
        }
    }

    pub fn health_snapshot(&self) -> Vec<EndpointHealthSnapshot> {
        let mut all = Vec::new();
        for client in self.clients.values() {
            all.extend(client.health_snapshot());
        }
        all
    }

    /// Background probe loop; exits when `shutdown` flips to true.
    pub async fn run_probes(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
