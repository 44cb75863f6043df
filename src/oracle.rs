//! USD price oracle providers
//!
//! The profit engine never touches HTTP directly; it consumes a `PriceSet`
//! resolved once per scan tick. Prices are keyed by canonical token id and
//! carry their observation time so staleness is checkable everywhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Clock;
use crate::errors::EngineError;

/// A USD rate with its observation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsdPrice {
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Price source seam. Implementations must return `OracleStale` rather than
/// a silently old price.
#[async_trait]
pub trait UsdOracle: Send + Sync {
    async fn usd_price(&self, canonical: &str) -> Result<UsdPrice, EngineError>;

    /// Health probe: can the oracle currently produce a fresh price at all?
    async fn probe(&self) -> Result<(), EngineError>;
}

/// Immutable per-tick view of USD rates, resolved by the scanner and passed
/// into the (pure, synchronous) profit engine.
#[derive(Debug, Clone, Default)]
pub struct PriceSet {
    prices: HashMap<String, UsdPrice>,
}

impl PriceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, canonical: impl Into<String>, price: UsdPrice) {
        self.prices.insert(canonical.into(), price);
    }

    pub fn get(&self, canonical: &str) -> Option<UsdPrice> {
        self.prices.get(canonical).copied()
    }
}

/// HTTP oracle with a freshness-bounded cache.
///
/// Expects `GET {base_url}/price?id=<canonical>` returning
/// `{"usd": "2500.12"}`. The exact provider behind the URL is an external
/// collaborator; only the shape is fixed here.
pub struct HttpUsdOracle {
    client: reqwest::Client,
    base_url: String,
    max_age: Duration,
    clock: Arc<dyn Clock>,
    cache: DashMap<String, UsdPrice>,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    usd: Decimal,
}

impl HttpUsdOracle {
    pub fn new(base_url: String, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            max_age,
            clock,
            cache: DashMap::new(),
        }
    }

    fn fresh(&self, price: &UsdPrice) -> bool {
        let age = self.clock.now() - price.observed_at;
        age.to_std().map(|a| a <= self.max_age).unwrap_or(false)
    }
}

#[async_trait]
impl UsdOracle for HttpUsdOracle {
    async fn usd_price(&self, canonical: &str) -> Result<UsdPrice, EngineError> {
        if let Some(cached) = self.cache.get(canonical) {
            if self.fresh(&cached) {
                return Ok(*cached);
            }
        }

        let url = format!("{}/price?id={canonical}", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.max_age.min(Duration::from_secs(5)))
            .send()
            .await
            .map_err(|_| EngineError::OracleStale { token: canonical.to_string() })?;

        let parsed: PriceResponse = response.json().await.map_err(|_| EngineError::OracleStale {
            token: canonical.to_string(),
        })?;

        let price = UsdPrice {
            price: parsed.usd,
            observed_at: self.clock.now(),
        };
        self.cache.insert(canonical.to_string(), price);
        Ok(price)
    }

    async fn probe(&self) -> Result<(), EngineError> {
        // Any fresh cached entry proves liveness; otherwise hit the endpoint.
        if self.cache.iter().any(|e| self.fresh(e.value())) {
            return Ok(());
        }
        self.usd_price("usd-coin").await.map(|_| ())
    }
}

/// Fixed price table. Used when `STATIC_PRICES` is configured (offline PAPER
/// runs) and as the oracle seam in tests.
pub struct StaticOracle {
    prices: HashMap<String, Decimal>,
    clock: Arc<dyn Clock>,
}

impl StaticOracle {
    pub fn new(prices: HashMap<String, Decimal>, clock: Arc<dyn Clock>) -> Self {
        Self { prices, clock }
    }
}

#[async_trait]
impl UsdOracle for StaticOracle {
    async fn usd_price(&self, canonical: &str) -> Result<UsdPrice, EngineError> {
        match self.prices.get(canonical) {
            Some(price) => Ok(UsdPrice {
                price: *price,
                observed_at: self.clock.now(),
            }),
            None => Err(EngineError::OracleStale { token: canonical.to_string() }),
        }
    }

    async fn probe(&self) -> Result<(), EngineError> {
        if self.prices.is_empty() {
            return Err(EngineError::OracleStale { token: "*".to_string() });
        }
        Ok(())
    }
}
