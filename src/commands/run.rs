//! Run the core service
//!
//! Wires the stores, price feed, execution engine, approval queue,
//! pyramid manager, and coordinator together, spawns the background
//! tasks, and waits for Ctrl-C. In-flight work completes on shutdown;
//! new work is refused once the signal fires.

use crate::commands::{open_platform, CommandError, CommandResult, Outcome};
use anyhow::Context;
use paper_trading::exec::scheduler;
use paper_trading::{
    BinancePriceSource, CachedPriceSource, Coordinator, ExecutionEngine, PendingQueue,
    PriceSource, PyramidManager, RiskEngine, StaticPriceSource, StopScanner, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

/// Dispatcher granularity; latency itself comes from config.
const DISPATCH_TICK_MS: u64 = 25;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub fn run(config_path: &str, offline: bool) -> CommandResult {
    let (config, sot, ts) = open_platform(config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
        .map_err(CommandError::Other)?;
    runtime.block_on(run_async(config, sot, ts, offline))
}

async fn run_async(
    config: paper_trading::CoreConfig,
    sot: Arc<paper_trading::SotStore>,
    ts: Arc<paper_trading::TsStore>,
    offline: bool,
) -> CommandResult {
    let prices: Arc<dyn PriceSource> = if offline {
        warn!("offline mode: static price source; stop scans will skip until prices are set");
        Arc::new(StaticPriceSource::new())
    } else {
        Arc::new(CachedPriceSource::new(
            BinancePriceSource::new(&config.price_source),
            &config.price_source,
        ))
    };

    let clock = Arc::new(SystemClock);
    let (fill_tx, fill_rx) = mpsc::unbounded_channel();
    let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();
    let (broadcast_tx, _broadcast_keepalive) = broadcast::channel(256);

    let engine = Arc::new(ExecutionEngine::new(
        sot.clone(),
        ts.clone(),
        prices.clone(),
        config.execution.clone(),
        clock.clone(),
        Box::new(paper_trading::clock::OsRandom::default()),
        fill_tx,
    ));
    let queue = Arc::new(PendingQueue::new(
        sot.clone(),
        ts.clone(),
        engine.clone(),
        prices.clone(),
        RiskEngine::new(config.risk.clone()),
        clock.clone(),
        resolution_tx,
        broadcast_tx.clone(),
    ));
    let pyramid = Arc::new(PyramidManager::new(
        sot.clone(),
        queue.clone(),
        engine.clone(),
        prices.clone(),
        clock.clone(),
        broadcast_tx.clone(),
    ));
    let coordinator = Coordinator::new(
        ts.clone(),
        pyramid.clone(),
        fill_rx,
        resolution_rx,
        broadcast_tx.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher_handle = tokio::spawn(scheduler::run_dispatcher(
        engine.clone(),
        Duration::from_millis(DISPATCH_TICK_MS),
        shutdown_rx.clone(),
    ));
    let scanner = StopScanner::new(engine.clone(), sot.clone(), prices.clone(), clock.clone());
    let scanner_handle = tokio::spawn(
        scanner.run(config.execution.stop_scan_interval_ms, shutdown_rx.clone()),
    );
    let coordinator_handle = tokio::spawn(
        coordinator.run(config.pyramid.pyramid_timer_interval_ms, shutdown_rx.clone()),
    );

    info!("==============================================");
    info!("  PAPER TRADING CORE - ONLINE");
    info!("  sot: {}", config.store.sot_db_path);
    info!("  ts:  {}", config.store.ts_db_path);
    info!(
        "  latency: {}ms (+{}ms jitter), stop scan: {}ms, pyramid timer: {}ms",
        config.execution.default_latency_ms,
        config.execution.random_latency_ms,
        config.execution.stop_scan_interval_ms,
        config.pyramid.pyramid_timer_interval_ms
    );
    info!("==============================================");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, initiating shutdown..."),
        Err(e) => warn!("signal handler error: {e}; shutting down"),
    }
    let _ = shutdown_tx.send(true);

    for (name, handle) in [
        ("dispatcher", dispatcher_handle),
        ("stop scanner", scanner_handle),
        ("coordinator", coordinator_handle),
    ] {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("{name} did not stop within {SHUTDOWN_GRACE:?}");
        }
    }

    info!("shutdown complete");
    Ok(Outcome::Interrupted)
}
