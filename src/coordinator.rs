//! Fill-event coordinator
//!
//! Single owner of the fan-out path: fills append in the SOT store,
//! arrive here on a channel, and are applied in order to the TS store,
//! the pyramid hooks, and the best-effort dashboard broadcast. Running
//! the pyramid timer on the same task keeps wave scheduling
//! single-owner - no two fills of the same session ever race.
//!
//! Repeated fatal errors on the same fill trip a circuit breaker: the
//! coordinator stops and the condition is surfaced for an operator.

use crate::common::{CircuitBreaker, CircuitBreakerConfig};
use crate::events::{BroadcastEvent, FillEvent, PendingResolution};
use crate::pyramid::manager::PyramidManager;
use crate::store::ts::TsStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct Coordinator {
    ts: Arc<TsStore>,
    pyramid: Arc<PyramidManager>,
    fill_rx: mpsc::UnboundedReceiver<FillEvent>,
    resolution_rx: mpsc::UnboundedReceiver<PendingResolution>,
    broadcast_tx: broadcast::Sender<BroadcastEvent>,
    breaker: CircuitBreaker,
}

impl Coordinator {
    pub fn new(
        ts: Arc<TsStore>,
        pyramid: Arc<PyramidManager>,
        fill_rx: mpsc::UnboundedReceiver<FillEvent>,
        resolution_rx: mpsc::UnboundedReceiver<PendingResolution>,
        broadcast_tx: broadcast::Sender<BroadcastEvent>,
    ) -> Self {
        Self {
            ts,
            pyramid,
            fill_rx,
            resolution_rx,
            broadcast_tx,
            breaker: CircuitBreaker::new(
                CircuitBreakerConfig::default().with_failure_threshold(3),
            ),
        }
    }

    /// Process one fill end to end. Returns false when the circuit
    /// breaker has tripped and the coordinator must stop.
    pub async fn handle_fill(&mut self, event: FillEvent) -> bool {
        debug!(
            "fill {}: {} {} {} @ {}",
            event.fill_id,
            event.side.as_str(),
            event.fill_qty,
            event.symbol,
            event.effective_price
        );

        // 1. Derived aggregates. TS failures are retried via the
        // breaker because the store is rebuildable but must not drift.
        if let Err(err) = self.ts.apply_fill(&event) {
            error!("TS projection of fill {} failed: {err}", event.fill_id);
            self.breaker.record_failure();
            if !self.breaker.can_attempt() {
                error!(
                    "coordinator circuit tripped on fill {}; stopping for operator attention",
                    event.fill_id
                );
                return false;
            }
            return true;
        }
        self.breaker.record_success();

        // 2. Pyramid progression.
        if event.is_pyramid() {
            if let Err(err) = self.pyramid.on_fill(&event).await {
                if err.is_fatal() {
                    error!("pyramid hook fatal on fill {}: {err}", event.fill_id);
                    return false;
                }
                warn!("pyramid hook error on fill {}: {err}", event.fill_id);
            }
        }

        // 3. Dashboard broadcast, best effort.
        let _ = self.broadcast_tx.send(BroadcastEvent::Fill {
            order_id: event.order_id,
            symbol: event.symbol.clone(),
            side: event.side,
            qty: event.fill_qty,
            price: event.effective_price,
        });
        true
    }

    pub async fn handle_resolution(&mut self, resolution: PendingResolution) {
        if let Err(err) = self.pyramid.on_rejection(&resolution).await {
            warn!(
                "rejection hook error for pending {}: {err}",
                resolution.pending_id
            );
        }
    }

    /// Drain everything currently queued without waiting: fills first,
    /// then resolutions, until both channels are momentarily empty.
    /// Used on shutdown and by tests driving the loop manually.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        loop {
            if let Ok(event) = self.fill_rx.try_recv() {
                processed += 1;
                if !self.handle_fill(event).await {
                    return processed;
                }
                continue;
            }
            if let Ok(resolution) = self.resolution_rx.try_recv() {
                processed += 1;
                self.handle_resolution(resolution).await;
                continue;
            }
            return processed;
        }
    }

    /// Main loop: fills and resolutions in arrival order, plus the
    /// pyramid timer, all on this one task.
    pub async fn run(mut self, timer_interval_ms: u64, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(Duration::from_millis(timer_interval_ms.max(1)));
        info!("coordinator started (pyramid timer {timer_interval_ms}ms)");
        loop {
            tokio::select! {
                maybe_fill = self.fill_rx.recv() => {
                    match maybe_fill {
                        Some(event) => {
                            if !self.handle_fill(event).await {
                                break;
                            }
                        }
                        None => {
                            info!("fill channel closed; coordinator exiting");
                            break;
                        }
                    }
                }
                maybe_resolution = self.resolution_rx.recv() => {
                    if let Some(resolution) = maybe_resolution {
                        self.handle_resolution(resolution).await;
                    }
                }
                _ = timer.tick() => {
                    if let Err(err) = self.pyramid.timer_tick().await {
                        warn!("pyramid timer tick failed: {err}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Finish what is already queued, then exit.
                        self.drain().await;
                        info!("coordinator shutting down");
                        break;
                    }
                }
            }
        }
    }
}
