//! Queue a purchase-order CSV into the approval pipeline

use crate::commands::{open_platform, CommandError, CommandResult, Outcome};
use anyhow::Context;
use paper_trading::{
    intake, BinancePriceSource, CachedPriceSource, ExecutionEngine, PendingQueue, PriceSource,
    RiskEngine, SystemClock,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

pub fn run(config_path: &str, csv_path: &str) -> CommandResult {
    let (config, sot, ts) = open_platform(config_path)?;

    let rows = intake::read_csv(csv_path)
        .with_context(|| format!("Failed to read {csv_path}"))
        .map_err(CommandError::Other)?;
    let (intents, errors) = intake::rows_to_intents(&rows);
    for error in &errors {
        warn!("{error}");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
        .map_err(CommandError::Other)?;

    runtime.block_on(async move {
        let prices: Arc<dyn PriceSource> = Arc::new(CachedPriceSource::new(
            BinancePriceSource::new(&config.price_source),
            &config.price_source,
        ));
        let clock = Arc::new(SystemClock);
        // Intake only queues; nothing executes until a human approves,
        // so the fill/resolution consumers are not running here.
        let (fill_tx, _fill_rx) = mpsc::unbounded_channel();
        let (resolution_tx, _resolution_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(16);

        let engine = Arc::new(ExecutionEngine::new(
            sot.clone(),
            ts.clone(),
            prices.clone(),
            config.execution.clone(),
            clock.clone(),
            Box::new(paper_trading::OsRandom::default()),
            fill_tx,
        ));
        let queue = PendingQueue::new(
            sot,
            ts,
            engine,
            prices,
            RiskEngine::new(config.risk.clone()),
            clock,
            resolution_tx,
            broadcast_tx,
        );

        let mut queued = 0usize;
        let mut flagged = 0usize;
        for intent in intents {
            match queue.queue(intent).await {
                Ok(pending) => {
                    queued += 1;
                    if pending.risk_note.is_some() {
                        flagged += 1;
                    }
                }
                Err(err) => warn!("queueing failed: {err}"),
            }
        }
        info!(
            "intake complete: {queued} queued ({flagged} with risk notes), {} rows skipped",
            errors.len()
        );
        Ok(Outcome::Done)
    })
}
