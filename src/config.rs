//! Runtime configuration
//!
//! Read once at startup from the environment (`.env` supported via dotenvy).
//! Anything invalid is fatal: the process exits nonzero before touching the
//! network.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::EngineError;
use crate::types::{ChainId, MevPolicy};

/// PAPER simulates settlement; LIVE submits on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl FromStr for ExecutionMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PAPER" => Ok(ExecutionMode::Paper),
            "LIVE" => Ok(ExecutionMode::Live),
            other => Err(EngineError::ConfigInvalid(format!(
                "EXECUTION_MODE must be PAPER or LIVE, got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Paper => write!(f, "PAPER"),
            ExecutionMode::Live => write!(f, "LIVE"),
        }
    }
}

impl FromStr for MevPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRIVATE" => Ok(MevPolicy::Private),
            "ALLOW_PUBLIC" => Ok(MevPolicy::AllowPublic),
            "PRIVATE_OR_REJECT" => Ok(MevPolicy::PrivateOrReject),
            other => Err(EngineError::ConfigInvalid(format!(
                "MEV_POLICY must be PRIVATE, ALLOW_PUBLIC or PRIVATE_OR_REJECT, got '{other}'"
            ))),
        }
    }
}

/// Which signal bus realization to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// In-process work queue with acknowledgement.
    Queue,
    /// Atomic-rename filesystem directories.
    Fs,
}

impl FromStr for BusKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" => Ok(BusKind::Queue),
            "fs" => Ok(BusKind::Fs),
            other => Err(EngineError::ConfigInvalid(format!(
                "BUS_KIND must be 'queue' or 'fs', got '{other}'"
            ))),
        }
    }
}

/// Per-chain connection settings. On-chain addresses (executor, multicall)
/// live in the registry; this is transport only.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub name: String,
    pub chain_id: ChainId,
    /// RPC endpoints in priority order.
    pub rpc_urls: Vec<String>,
    pub private_relay_url: Option<String>,
}

/// Complete engine settings, immutable after load.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: ExecutionMode,
    pub min_profit_usd: Decimal,
    pub max_base_fee_gwei: u64,
    pub max_consecutive_failures: u32,
    pub scan_interval: Duration,
    pub flash_loan_enabled: bool,
    /// Preferred provider id; registry rank decides among the rest.
    pub flash_loan_provider: String,
    pub mev_policy: MevPolicy,
    pub chains: Vec<ChainSettings>,
    /// Hex-encoded signing key. Parsed into a signer at startup so a bad key
    /// fails before the first scan tick.
    pub private_key: String,

    pub slippage_bps: u32,
    /// Quotes older than this many blocks behind head are dropped.
    pub freshness_blocks: u64,
    pub max_hops: usize,
    /// Simulated profit may undercut the declared profit by at most this.
    pub sim_tolerance_bps: u32,
    /// Trades at or above this USD value demand MEV protection.
    pub high_value_usd: Decimal,
    pub min_notional_usd: Decimal,
    /// Points in the geometric probe-amount sweep.
    pub probe_points: u32,
    /// Max share of the shallowest pool's depth a probe may take (bps).
    pub max_depth_share_bps: u32,

    pub bus_kind: BusKind,
    pub bus_dir: PathBuf,
    pub signal_ttl: Duration,

    pub oracle_url: Option<String>,
    pub oracle_max_age: Duration,
    /// Fallback USD prices by canonical id, `id=price` comma-separated.
    pub static_prices: HashMap<String, Decimal>,

    pub registry_path: PathBuf,
    pub rpc_timeout: Duration,
    pub probe_interval: Duration,
    pub worker_threads: usize,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, EngineError>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| EngineError::ConfigInvalid(format!("{key}: {e}"))),
        None => Ok(default),
    }
}

fn require_env(key: &str) -> Result<String, EngineError> {
    env_var(key).ok_or_else(|| EngineError::ConfigInvalid(format!("{key} not set")))
}

impl Settings {
    /// Load and validate settings from the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        let mode: ExecutionMode = parse_env("EXECUTION_MODE", ExecutionMode::Paper)?;

        let chains = Self::parse_chains()?;
        if chains.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "CHAINS must list at least one chain".into(),
            ));
        }

        let private_key = match mode {
            // LIVE cannot start without key material.
            ExecutionMode::Live => require_env("PRIVATE_KEY")?,
            ExecutionMode::Paper => env_var("PRIVATE_KEY").unwrap_or_else(|| {
                // Throwaway key: PAPER never signs anything that leaves the process.
                "0x0000000000000000000000000000000000000000000000000000000000000001".into()
            }),
        };

        let settings = Self {
            mode,
            min_profit_usd: parse_env("MIN_PROFIT_USD", Decimal::new(5, 0))?,
            max_base_fee_gwei: parse_env("MAX_BASE_FEE_GWEI", 150u64)?,
            max_consecutive_failures: parse_env("MAX_CONSECUTIVE_FAILURES", 10u32)?,
            scan_interval: Duration::from_millis(parse_env("SCAN_INTERVAL_MS", 1_000u64)?),
            flash_loan_enabled: parse_env("FLASH_LOAN_ENABLED", true)?,
            flash_loan_provider: env_var("FLASH_LOAN_PROVIDER")
                .unwrap_or_else(|| "balancer-v2".into()),
            mev_policy: parse_env("MEV_POLICY", MevPolicy::Private)?,
            chains,
            private_key,
            slippage_bps: parse_env("SLIPPAGE_BPS", 10u32)?,
            freshness_blocks: parse_env("FRESHNESS_BLOCKS", 2u64)?,
            max_hops: parse_env("MAX_HOPS", 4usize)?,
            sim_tolerance_bps: parse_env("SIM_TOLERANCE_BPS", 1_000u32)?,
            high_value_usd: parse_env("HIGH_VALUE_USD", Decimal::new(50_000, 0))?,
            min_notional_usd: parse_env("MIN_NOTIONAL_USD", Decimal::new(100, 0))?,
            probe_points: parse_env("PROBE_POINTS", 5u32)?,
            max_depth_share_bps: parse_env("MAX_DEPTH_SHARE_BPS", 1_000u32)?,
            bus_kind: parse_env("BUS_KIND", BusKind::Queue)?,
            bus_dir: PathBuf::from(env_var("BUS_DIR").unwrap_or_else(|| "signals".into())),
            signal_ttl: Duration::from_millis(parse_env("SIGNAL_TTL_MS", 5_000u64)?),
            oracle_url: env_var("ORACLE_URL"),
            oracle_max_age: Duration::from_secs(parse_env("ORACLE_MAX_AGE_SECS", 60u64)?),
            static_prices: Self::parse_static_prices()?,
            registry_path: PathBuf::from(
                env_var("REGISTRY_PATH").unwrap_or_else(|| "registry.json".into()),
            ),
            rpc_timeout: Duration::from_millis(parse_env("RPC_TIMEOUT_MS", 2_000u64)?),
            probe_interval: Duration::from_secs(parse_env("HEALTH_PROBE_SECS", 10u64)?),
            worker_threads: parse_env("WORKER_THREADS", 4usize)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// CHAINS=ethereum:1,arbitrum:42161 with RPC_URLS_<NAME> per entry.
    fn parse_chains() -> Result<Vec<ChainSettings>, EngineError> {
        let raw = match env_var("CHAINS") {
            Some(raw) => raw,
            None => return Ok(Vec::new()),
        };

        let mut chains = Vec::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (name, id) = entry.split_once(':').ok_or_else(|| {
                EngineError::ConfigInvalid(format!("CHAINS entry '{entry}' must be name:chain_id"))
            })?;
            let chain_id: ChainId = id
                .parse()
                .map_err(|_| EngineError::ConfigInvalid(format!("bad chain id in '{entry}'")))?;

            let key = format!("RPC_URLS_{}", name.to_ascii_uppercase());
            let urls = require_env(&key)?
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect::<Vec<_>>();
            if urls.is_empty() {
                return Err(EngineError::ConfigInvalid(format!("{key} lists no urls")));
            }

            let relay_key = format!("PRIVATE_RELAY_URL_{}", name.to_ascii_uppercase());
            chains.push(ChainSettings {
                name: name.to_string(),
                chain_id,
                rpc_urls: urls,
                private_relay_url: env_var(&relay_key),
            });
        }
        Ok(chains)
    }

    /// STATIC_PRICES=usd-coin=1,ethereum=2500.50
    fn parse_static_prices() -> Result<HashMap<String, Decimal>, EngineError> {
        let mut prices = HashMap::new();
        if let Some(raw) = env_var("STATIC_PRICES") {
            for entry in raw.split(',') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                let (id, price) = entry.split_once('=').ok_or_else(|| {
                    EngineError::ConfigInvalid(format!(
                        "STATIC_PRICES entry '{entry}' must be id=price"
                    ))
                })?;
                let price = Decimal::from_str(price.trim()).map_err(|e| {
                    EngineError::ConfigInvalid(format!("STATIC_PRICES '{entry}': {e}"))
                })?;
                prices.insert(id.trim().to_string(), price);
            }
        }
        Ok(prices)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.scan_interval.is_zero() {
            return Err(EngineError::ConfigInvalid("SCAN_INTERVAL_MS must be > 0".into()));
        }
        if self.max_hops == 0 || self.max_hops > 6 {
            return Err(EngineError::ConfigInvalid("MAX_HOPS must be in 1..=6".into()));
        }
        if self.min_profit_usd <= Decimal::ZERO {
            return Err(EngineError::ConfigInvalid("MIN_PROFIT_USD must be positive".into()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(EngineError::ConfigInvalid(
                "MAX_CONSECUTIVE_FAILURES must be > 0".into(),
            ));
        }
        if self.probe_points == 0 {
            return Err(EngineError::ConfigInvalid("PROBE_POINTS must be > 0".into()));
        }
        if self.worker_threads == 0 {
            return Err(EngineError::ConfigInvalid("WORKER_THREADS must be > 0".into()));
        }
        if self.oracle_url.is_none() && self.static_prices.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "set ORACLE_URL or STATIC_PRICES; the profit engine needs USD rates".into(),
            ));
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainSettings> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}
