//! Stop-loss scanner
//!
//! Periodically sweeps armed stop orders against the current price.
//! SELL stops trigger at or below the stop price, BUY stops at or
//! above. A dead price feed skips the tick with a STOP_SCAN_SKIPPED
//! event per armed order; the stop stays armed.

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::exec::engine::ExecutionEngine;
use crate::price_source::PriceSource;
use crate::store::sot::{Order, SotStore};
use crate::types::Side;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct StopScanner {
    engine: Arc<ExecutionEngine>,
    sot: Arc<SotStore>,
    prices: Arc<dyn PriceSource>,
    clock: Arc<dyn Clock>,
}

impl StopScanner {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        sot: Arc<SotStore>,
        prices: Arc<dyn PriceSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            sot,
            prices,
            clock,
        }
    }

    fn should_trigger(order: &Order, current_price: Decimal) -> bool {
        let Some(stop_price) = order.stop_price else {
            return false;
        };
        match order.side {
            Side::Sell => current_price <= stop_price,
            Side::Buy => current_price >= stop_price,
        }
    }

    /// One sweep over the armed stops. Returns how many triggered.
    pub async fn scan_once(&self) -> CoreResult<usize> {
        let armed = self.sot.list_armed_stops()?;
        if armed.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();
        let mut triggered = 0;
        for order in armed {
            match self.prices.current_price(&order.symbol).await {
                Ok(quote) => {
                    if Self::should_trigger(&order, quote.price) {
                        match self.engine.trigger_stop(order, quote.price).await {
                            Ok(_) => triggered += 1,
                            Err(err) if err.is_fatal() => return Err(err),
                            Err(err) => warn!("stop trigger failed: {err}"),
                        }
                    }
                }
                Err(CoreError::PriceSourceUnavailable(reason)) => {
                    // The stop stays armed; record the skip and retry
                    // next tick.
                    debug!(
                        "stop scan skipped for order {} ({}): {reason}",
                        order.id, order.symbol
                    );
                    self.sot.append_event(
                        order.id,
                        crate::types::OrderEventType::StopScanSkipped,
                        serde_json::json!({ "reason": reason }),
                        now,
                    )?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(triggered)
    }

    /// Background task: sweep on a timer until shutdown.
    pub async fn run(self, interval_ms: u64, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        info!("stop-loss scanner started ({interval_ms}ms interval)");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.scan_once().await {
                        Ok(0) => {}
                        Ok(n) => info!("stop scan triggered {n} orders"),
                        Err(err) if err.is_fatal() => {
                            error!("stop scanner paused on fatal error: {err}");
                            break;
                        }
                        Err(err) => warn!("stop scan error: {err}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stop-loss scanner shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SeededRng, SimClock};
    use crate::config::ExecutionConfig;
    use crate::events::FillEvent;
    use crate::exec::engine::OrderRequest;
    use crate::price_source::StaticPriceSource;
    use crate::store::ts::TsStore;
    use crate::types::{OrderEventType, OrderSource, OrderStatus, OrderType, Symbol};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct Harness {
        scanner: StopScanner,
        engine: Arc<ExecutionEngine>,
        sot: Arc<SotStore>,
        ts: Arc<TsStore>,
        prices: Arc<StaticPriceSource>,
        fill_rx: mpsc::UnboundedReceiver<FillEvent>,
    }

    fn harness() -> Harness {
        let sot = Arc::new(SotStore::open_in_memory().unwrap());
        let ts = Arc::new(TsStore::open_in_memory().unwrap());
        let prices = Arc::new(StaticPriceSource::new());
        let clock = Arc::new(SimClock::from_millis(1_700_000_000_000));
        let (fill_tx, fill_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(ExecutionEngine::new(
            sot.clone(),
            ts.clone(),
            prices.clone(),
            ExecutionConfig::default(),
            clock.clone(),
            Box::new(SeededRng::new(1)),
            fill_tx,
        ));
        let scanner = StopScanner::new(engine.clone(), sot.clone(), prices.clone(), clock);
        Harness {
            scanner,
            engine,
            sot,
            ts,
            prices,
            fill_rx,
        }
    }

    async fn open_position(h: &mut Harness, qty: Decimal, price: Decimal) {
        h.engine
            .submit(OrderRequest {
                client_order_id: "entry".to_string(),
                symbol: Symbol::new("BTCUSDT"),
                side: Side::Buy,
                order_type: OrderType::Market,
                qty,
                price,
                stop_price: None,
                source: OrderSource::Strategy,
                source_ref: None,
            })
            .await
            .unwrap();
        let event = h.fill_rx.try_recv().unwrap();
        h.ts.apply_fill(&event).unwrap();
    }

    async fn arm_stop(h: &Harness, stop: Decimal, qty: Decimal) -> i64 {
        let order = h
            .engine
            .submit(OrderRequest {
                client_order_id: "stop".to_string(),
                symbol: Symbol::new("BTCUSDT"),
                side: Side::Sell,
                order_type: OrderType::StopLoss,
                qty,
                price: stop,
                stop_price: Some(stop),
                source: OrderSource::Strategy,
                source_ref: None,
            })
            .await
            .unwrap();
        order.id
    }

    #[tokio::test]
    async fn test_unavailable_feed_emits_skip_and_keeps_stop_armed() {
        let mut h = harness();
        open_position(&mut h, dec!(5), dec!(100)).await;
        let order_id = arm_stop(&h, dec!(90), dec!(5)).await;

        // Three ticks with no price.
        for _ in 0..3 {
            assert_eq!(h.scanner.scan_once().await.unwrap(), 0);
        }
        let skips = h
            .sot
            .list_events(order_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == OrderEventType::StopScanSkipped)
            .count();
        assert_eq!(skips, 3);
        assert_eq!(h.sot.list_armed_stops().unwrap().len(), 1);

        // Feed recovers below the stop: triggered and filled at 85.
        h.prices.set_price(&Symbol::new("BTCUSDT"), dec!(85));
        assert_eq!(h.scanner.scan_once().await.unwrap(), 1);
        let order = h.sot.get_order(order_id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        let fills = h.sot.list_fills(order_id).unwrap();
        assert_eq!(fills[0].effective_price, dec!(85));
    }

    #[tokio::test]
    async fn test_sell_stop_does_not_trigger_above_stop() {
        let mut h = harness();
        open_position(&mut h, dec!(5), dec!(100)).await;
        arm_stop(&h, dec!(90), dec!(5)).await;
        h.prices.set_price(&Symbol::new("BTCUSDT"), dec!(95));
        assert_eq!(h.scanner.scan_once().await.unwrap(), 0);
        assert_eq!(h.sot.list_armed_stops().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_buy_stop_triggers_at_or_above() {
        let h = harness();
        let order = h
            .engine
            .submit(OrderRequest {
                client_order_id: "buy-stop".to_string(),
                symbol: Symbol::new("BTCUSDT"),
                side: Side::Buy,
                order_type: OrderType::StopLoss,
                qty: dec!(1),
                price: dec!(110),
                stop_price: Some(dec!(110)),
                source: OrderSource::Strategy,
                source_ref: None,
            })
            .await
            .unwrap();
        h.prices.set_price(&Symbol::new("BTCUSDT"), dec!(110));
        assert_eq!(h.scanner.scan_once().await.unwrap(), 1);
        let order = h.sot.get_order(order.id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
    }
}
