//! Pending-order approval queue
//!
//! Every intent - spreadsheet row, strategy signal, or pyramid wave -
//! lands here first. Queuing resolves pip sizing, annotates risk
//! violations for the human approver, and persists the row. Approval is
//! an optimistic CAS followed by hand-off to the execution engine;
//! rejection emits a resolution event the pyramid manager listens for.

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::events::{BroadcastEvent, PendingResolution};
use crate::exec::engine::{ExecutionEngine, OrderRequest};
use crate::price_source::PriceSource;
use crate::risk::{RiskEngine, RiskView};
use crate::store::sot::{Order, OrderIntent, PendingFilter, PendingOrder, SotStore};
use crate::store::ts::TsStore;
use crate::types::PendingStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

pub struct PendingQueue {
    sot: Arc<SotStore>,
    ts: Arc<TsStore>,
    engine: Arc<ExecutionEngine>,
    prices: Arc<dyn PriceSource>,
    risk: RiskEngine,
    clock: Arc<dyn Clock>,
    resolution_tx: mpsc::UnboundedSender<PendingResolution>,
    broadcast_tx: broadcast::Sender<BroadcastEvent>,
}

impl PendingQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sot: Arc<SotStore>,
        ts: Arc<TsStore>,
        engine: Arc<ExecutionEngine>,
        prices: Arc<dyn PriceSource>,
        risk: RiskEngine,
        clock: Arc<dyn Clock>,
        resolution_tx: mpsc::UnboundedSender<PendingResolution>,
        broadcast_tx: broadcast::Sender<BroadcastEvent>,
    ) -> Self {
        Self {
            sot,
            ts,
            engine,
            prices,
            risk,
            clock,
            resolution_tx,
            broadcast_tx,
        }
    }

    /// Queue an intent for approval.
    ///
    /// Pip-sized intents are resolved against exchange lot metadata;
    /// risk violations become the `risk_note`, never a rejection.
    /// Idempotent on `(source, source_ref)`: a duplicate returns the
    /// existing row and emits nothing.
    pub async fn queue(&self, intent: OrderIntent) -> CoreResult<PendingOrder> {
        let now = self.clock.now();

        let (qty, pip_note) = match (intent.quantity, intent.pips) {
            (Some(qty), None) => {
                if qty <= Decimal::ZERO {
                    return Err(CoreError::validation(format!(
                        "quantity must be positive, got {qty}"
                    )));
                }
                (qty, None)
            }
            (None, Some(pips)) => {
                if pips <= Decimal::ZERO {
                    return Err(CoreError::validation(format!(
                        "pips must be positive, got {pips}"
                    )));
                }
                let info = self.prices.exchange_info(&intent.symbol).await?;
                self.risk.resolve_qty(&info, pips)
            }
            _ => {
                return Err(CoreError::validation(
                    "exactly one of quantity or pips must be set",
                ))
            }
        };

        let view = self.freeze_risk_view(&intent, now).await?;
        let exposure_note = self.risk.assess(&view, qty * intent.price);
        let risk_note = match (pip_note, exposure_note) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
        if let Some(note) = &risk_note {
            warn!("queuing {} with risk note: {note}", intent.symbol);
        }

        let (pending, created) = self.sot.queue_pending(&intent, qty, risk_note.as_deref(), now)?;
        if created {
            info!(
                "pending order {} queued: {} {} {} @ {} ({})",
                pending.id,
                pending.side.as_str(),
                pending.quantity,
                pending.symbol,
                pending.price,
                pending.source.as_str()
            );
            let _ = self.broadcast_tx.send(BroadcastEvent::PendingQueued {
                pending_id: pending.id,
                symbol: pending.symbol.clone(),
                source: pending.source,
                risk_note: pending.risk_note.clone(),
            });
        }
        Ok(pending)
    }

    /// Approve and hand off to the execution engine. On hand-off
    /// failure the row rolls back to PENDING with the error note and a
    /// bumped attempt counter; a lost CAS race returns `StaleState`.
    pub async fn approve(
        &self,
        id: i64,
        reviewer: &str,
        note: Option<&str>,
    ) -> CoreResult<Order> {
        let now = self.clock.now();
        let pending = self
            .sot
            .mark_pending(id, PendingStatus::Approved, reviewer, note, now)?;

        let request = OrderRequest::from_pending(&pending);
        match self.engine.submit(request).await {
            Ok(order) => {
                self.sot.mark_pending_executed(id)?;
                self.emit_resolution(&pending, true, reviewer, note, now);
                info!("pending order {id} approved by {reviewer} -> order {}", order.id);
                Ok(order)
            }
            // The order fact exists (cancelled with an ERROR event);
            // the approval itself succeeded.
            Err(err @ CoreError::InsufficientPosition { .. }) => {
                self.sot.mark_pending_executed(id)?;
                self.emit_resolution(&pending, true, reviewer, note, now);
                Err(err)
            }
            Err(err) => {
                warn!("hand-off of pending order {id} failed: {err}; rolling back to PENDING");
                self.sot
                    .reset_pending_after_failure(id, &err.to_string())?;
                Err(err)
            }
        }
    }

    /// Reject with a reason. Pyramid-sourced rejections reach the
    /// session manager through the resolution channel.
    pub async fn reject(&self, id: i64, reviewer: &str, reason: &str) -> CoreResult<PendingOrder> {
        let now = self.clock.now();
        let pending =
            self.sot
                .mark_pending(id, PendingStatus::Rejected, reviewer, Some(reason), now)?;
        info!("pending order {id} rejected by {reviewer}: {reason}");
        self.emit_resolution(&pending, false, reviewer, Some(reason), now);
        Ok(pending)
    }

    pub fn list(&self, filter: &PendingFilter) -> CoreResult<Vec<PendingOrder>> {
        self.sot.list_pending(filter)
    }

    pub fn get(&self, id: i64) -> CoreResult<Option<PendingOrder>> {
        self.sot.get_pending(id)
    }

    fn emit_resolution(
        &self,
        pending: &PendingOrder,
        approved: bool,
        reviewer: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let resolution = PendingResolution {
            pending_id: pending.id,
            source: pending.source,
            source_ref: pending.source_ref.clone(),
            approved,
            reviewed_by: reviewer.to_string(),
            note: note.map(|n| n.to_string()),
            resolved_at: now,
        };
        if self.resolution_tx.send(resolution).is_err() {
            warn!("resolution channel closed; coordinator is down");
        }
        let _ = self.broadcast_tx.send(BroadcastEvent::PendingResolved {
            pending_id: pending.id,
            approved,
        });
    }

    /// Freeze the account view the risk checks run against. Inside one
    /// queue call the view never changes, so the checks stay pure.
    async fn freeze_risk_view(
        &self,
        intent: &OrderIntent,
        now: DateTime<Utc>,
    ) -> CoreResult<RiskView> {
        let position = self.ts.get_position(&intent.symbol)?;
        let symbol_exposure = match &position {
            Some(pos) if !pos.quantity.is_zero() => {
                // Mark at the live price when the feed is up; fall back
                // to the entry average when it is not.
                let mark = match self.prices.current_price(&intent.symbol).await {
                    Ok(quote) => quote.price,
                    Err(_) => pos.avg_entry_price,
                };
                pos.quantity * mark
            }
            _ => Decimal::ZERO,
        };
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();
        let daily_realized = self.sot.sum_realized_pnl_since(midnight)?;
        Ok(RiskView {
            equity: self.risk.config().equity,
            symbol_exposure,
            daily_realized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SeededRng, SimClock};
    use crate::config::{ExecutionConfig, RiskConfig};
    use crate::events::FillEvent;
    use crate::price_source::StaticPriceSource;
    use crate::types::{OrderSource, OrderStatus, OrderType, Side, Symbol};
    use rust_decimal_macros::dec;

    struct Harness {
        queue: PendingQueue,
        sot: Arc<SotStore>,
        ts: Arc<TsStore>,
        prices: Arc<StaticPriceSource>,
        fill_rx: mpsc::UnboundedReceiver<FillEvent>,
        resolution_rx: mpsc::UnboundedReceiver<PendingResolution>,
    }

    fn harness() -> Harness {
        let sot = Arc::new(SotStore::open_in_memory().unwrap());
        let ts = Arc::new(TsStore::open_in_memory().unwrap());
        let prices = Arc::new(StaticPriceSource::new());
        let clock = Arc::new(SimClock::from_millis(1_700_000_000_000));
        let (fill_tx, fill_rx) = mpsc::unbounded_channel();
        let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(16);
        let engine = Arc::new(ExecutionEngine::new(
            sot.clone(),
            ts.clone(),
            prices.clone(),
            ExecutionConfig::default(),
            clock.clone(),
            Box::new(SeededRng::new(3)),
            fill_tx,
        ));
        let queue = PendingQueue::new(
            sot.clone(),
            ts.clone(),
            engine,
            prices.clone(),
            RiskEngine::new(RiskConfig::default()),
            clock,
            resolution_tx,
            broadcast_tx,
        );
        Harness {
            queue,
            sot,
            ts,
            prices,
            fill_rx,
            resolution_rx,
        }
    }

    fn intent(side: Side, qty: Decimal, price: Decimal) -> OrderIntent {
        OrderIntent {
            client_order_id: None,
            symbol: Symbol::new("BTCUSDT"),
            side,
            order_type: OrderType::Market,
            quantity: Some(qty),
            pips: None,
            price,
            stop_price: None,
            source: OrderSource::Strategy,
            source_ref: None,
            strategy_name: None,
            confidence: None,
        }
    }

    #[tokio::test]
    async fn test_queue_approve_execute_flow() {
        let mut h = harness();
        let pending = h.queue.queue(intent(Side::Buy, dec!(1), dec!(100))).await.unwrap();
        assert_eq!(pending.status, PendingStatus::Pending);
        assert!(pending.risk_note.is_none());

        let order = h.queue.approve(pending.id, "alice", None).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        let pending = h.sot.get_pending(pending.id).unwrap().unwrap();
        assert_eq!(pending.status, PendingStatus::Executed);
        assert!(h.fill_rx.try_recv().is_ok());

        let resolution = h.resolution_rx.try_recv().unwrap();
        assert!(resolution.approved);
    }

    #[tokio::test]
    async fn test_queue_resolves_pips() {
        let h = harness();
        let mut i = intent(Side::Buy, dec!(1), dec!(100));
        i.quantity = None;
        i.pips = Some(dec!(3));
        let pending = h.queue.queue(i).await.unwrap();
        // 3 pips x 2.0 multiplier x 0.00001 min_qty
        assert_eq!(pending.quantity, dec!(0.00006));
        assert_eq!(pending.pips, Some(dec!(3)));
    }

    #[tokio::test]
    async fn test_risk_note_populated_but_order_queues() {
        let h = harness();
        // 100k equity, 10% cap; 20k exposure breaches it.
        let pending = h
            .queue
            .queue(intent(Side::Buy, dec!(200), dec!(100)))
            .await
            .unwrap();
        assert_eq!(pending.status, PendingStatus::Pending);
        let note = pending.risk_note.unwrap();
        assert!(note.contains("position 20.0% exceeds max 10.0%"));
    }

    #[tokio::test]
    async fn test_reject_emits_resolution() {
        let mut h = harness();
        let mut i = intent(Side::Buy, dec!(1), dec!(100));
        i.source = OrderSource::Pyramid;
        i.source_ref = Some("pyramid:1:wave:0".to_string());
        let pending = h.queue.queue(i).await.unwrap();

        let rejected = h
            .queue
            .reject(pending.id, "bob", "volatility")
            .await
            .unwrap();
        assert_eq!(rejected.status, PendingStatus::Rejected);
        assert_eq!(rejected.note.as_deref(), Some("volatility"));

        let resolution = h.resolution_rx.try_recv().unwrap();
        assert!(!resolution.approved);
        assert_eq!(resolution.source, OrderSource::Pyramid);
        assert_eq!(
            resolution.source_ref.as_deref(),
            Some("pyramid:1:wave:0")
        );
    }

    #[tokio::test]
    async fn test_concurrent_review_single_cas_winner() {
        let h = harness();
        let pending = h.queue.queue(intent(Side::Buy, dec!(1), dec!(100))).await.unwrap();
        h.queue.approve(pending.id, "alice", None).await.unwrap();
        let err = h.queue.reject(pending.id, "bob", "too late").await.unwrap_err();
        assert!(matches!(err, CoreError::StaleState(_)));
    }

    #[tokio::test]
    async fn test_approve_oversell_marks_executed_and_surfaces_error() {
        let mut h = harness();
        // Build a 5-unit position first.
        let buy = h.queue.queue(intent(Side::Buy, dec!(5), dec!(100))).await.unwrap();
        h.queue.approve(buy.id, "alice", None).await.unwrap();
        h.ts.apply_fill(&h.fill_rx.try_recv().unwrap()).unwrap();

        let sell = h.queue.queue(intent(Side::Sell, dec!(10), dec!(110))).await.unwrap();
        let err = h.queue.approve(sell.id, "alice", None).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientPosition { .. }));

        // Approval stands; the order fact is cancelled.
        let pending = h.sot.get_pending(sell.id).unwrap().unwrap();
        assert_eq!(pending.status, PendingStatus::Executed);
        let position = h.ts.get_position(&Symbol::new("BTCUSDT")).unwrap().unwrap();
        assert_eq!(position.quantity, dec!(5));
    }

    #[tokio::test]
    async fn test_duplicate_source_ref_returns_same_row() {
        let h = harness();
        let mut i = intent(Side::Buy, dec!(1), dec!(100));
        i.source = OrderSource::Pyramid;
        i.source_ref = Some("pyramid:9:wave:1".to_string());
        let a = h.queue.queue(i.clone()).await.unwrap();
        let b = h.queue.queue(i).await.unwrap();
        assert_eq!(a.id, b.id);
    }
}
