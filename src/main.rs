//! flasharb - multi-chain flash-loan DEX arbitrage engine

use clap::Parser;
use eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flasharb::bus;
use flasharb::chain::ChainClientPool;
use flasharb::config::{ExecutionMode, Settings};
use flasharb::context::{CoreContext, SystemClock};
use flasharb::executor::ExecutionEngine;
use flasharb::metrics::Metrics;
use flasharb::oracle::{HttpUsdOracle, StaticOracle, UsdOracle};
use flasharb::registry::Registry;
use flasharb::scanner::Scanner;
use flasharb::supervisor::{CircuitBreaker, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "flasharb")]
#[command(about = "Multi-chain flash-loan DEX arbitrage engine")]
struct Args {
    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Registry JSON path (overrides REGISTRY_PATH)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Execution mode override: paper | live
    #[arg(long)]
    mode: Option<ExecutionMode>,

    /// Run a single scan tick and exit (smoke testing)
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .map_err(|e| eyre::eyre!("env file {}: {e}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let mut settings = Settings::from_env().map_err(|e| eyre::eyre!("{e}"))?;
    if let Some(mode) = args.mode {
        settings.mode = mode;
    }
    if let Some(path) = args.registry {
        settings.registry_path = path;
    }

    info!(mode = %settings.mode, chains = settings.chains.len(), "starting flasharb");

    let registry =
        Arc::new(Registry::load(&settings.registry_path).map_err(|e| eyre::eyre!("{e}"))?);
    let settings = Arc::new(settings);
    let metrics = Arc::new(Metrics::new());
    let clock = Arc::new(SystemClock);

    let chains = Arc::new(
        ChainClientPool::connect(&settings, &registry, Arc::clone(&metrics))
            .map_err(|e| eyre::eyre!("{e}"))?,
    );
    chains.verify_all().await.map_err(|e| eyre::eyre!("{e}"))?;

    let bus = bus::build(&settings).map_err(|e| eyre::eyre!("{e}"))?;

    let oracle: Arc<dyn UsdOracle> = match &settings.oracle_url {
        Some(url) => Arc::new(HttpUsdOracle::new(
            url.clone(),
            settings.oracle_max_age,
            clock.clone() as Arc<dyn flasharb::context::Clock>,
        )),
        None => Arc::new(StaticOracle::new(
            settings.static_prices.clone(),
            clock.clone() as Arc<dyn flasharb::context::Clock>,
        )),
    };

    let ctx = CoreContext {
        settings: Arc::clone(&settings),
        registry,
        chains: Arc::clone(&chains),
        bus,
        oracle,
        clock,
        metrics: Arc::clone(&metrics),
    };

    let breaker = Arc::new(CircuitBreaker::new(
        settings.max_consecutive_failures,
        settings.scan_interval.as_millis() as u64,
        Arc::clone(&metrics),
    ));

    let engine = Arc::new(
        ExecutionEngine::new(ctx.clone(), Arc::clone(&breaker)).map_err(|e| eyre::eyre!("{e}"))?,
    );
    info!(submitter = %engine.submitter_address(), "execution engine ready");

    let scanner = Scanner::new(ctx.clone(), breaker.interval_handle());
    let supervisor = Supervisor::new(ctx.clone(), Arc::clone(&breaker), engine.submitter_address());

    if args.once {
        let emitted = scanner.tick().await;
        info!(emitted, "single scan tick complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe_task = tokio::spawn({
        let chains = Arc::clone(&chains);
        let rx = shutdown_rx.clone();
        async move { chains.run_probes(rx).await }
    });
    let supervisor_task = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { supervisor.run(rx).await }
    });
    let engine_task = tokio::spawn({
        let rx = shutdown_rx.clone();
        let engine = Arc::clone(&engine);
        async move { engine.run(rx).await }
    });
    let scanner_task = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { scanner.run(rx).await }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    // Scanner first (stops producing), then the engine drains in-flight
    // signals, then the supervisor, and the chain pool probes last.
    if let Err(err) = scanner_task.await {
        error!(%err, "scanner task panicked");
    }
    if let Err(err) = engine_task.await {
        error!(%err, "execution engine task panicked");
    }
    if let Err(err) = supervisor_task.await {
        error!(%err, "supervisor task panicked");
    }
    if let Err(err) = probe_task.await {
        error!(%err, "probe task panicked");
    }

    info!("clean shutdown");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
