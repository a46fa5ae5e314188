//! Pre-trade risk checks
//!
//! Three pure functions over a frozen view of account state: pip
//! sizing, position-size exposure, and daily realized loss. Violations
//! never block queuing - they become the `risk_note` the human approver
//! sees. The user stays the final authority.

use crate::config::RiskConfig;
use crate::money::round_to_step;
use crate::price_source::ExchangeInfo;
use rust_decimal::Decimal;

/// Account state snapshot the queue freezes before running checks.
/// Determinism matters: the same view always yields the same notes.
#[derive(Debug, Clone)]
pub struct RiskView {
    /// Account equity, denominator of both percentage checks.
    pub equity: Decimal,
    /// Current exposure on the intent's symbol (qty x mark price).
    pub symbol_exposure: Decimal,
    /// Realized PnL accumulated today (UTC); losses are negative.
    pub daily_realized: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Resolve a pip count into an order quantity on the exchange step
    /// grid: `pips x pip_multiplier x min_qty`, quantized.
    ///
    /// An out-of-range result clamps to the nearest bound and reports
    /// the violation as a note; the order still queues.
    pub fn resolve_qty(&self, info: &ExchangeInfo, pips: Decimal) -> (Decimal, Option<String>) {
        let raw = pips * self.config.pip_multiplier * info.min_qty;
        let qty = round_to_step(raw, info.step_size);

        if qty < info.min_qty {
            return (
                info.min_qty,
                Some(format!(
                    "pip-resolved qty {qty} below exchange min {}; clamped",
                    info.min_qty
                )),
            );
        }
        if qty > info.max_qty {
            return (
                info.max_qty,
                Some(format!(
                    "pip-resolved qty {qty} above exchange max {}; clamped",
                    info.max_qty
                )),
            );
        }
        (qty, None)
    }

    /// Exposure check: `(X + delta) / E <= max_position_pct`.
    pub fn check_position_size(&self, view: &RiskView, delta: Decimal) -> Option<String> {
        if view.equity <= Decimal::ZERO {
            return Some("equity is zero; cannot size position".to_string());
        }
        let pct = (view.symbol_exposure + delta) / view.equity * Decimal::ONE_HUNDRED;
        if pct > self.config.max_position_size_pct {
            Some(format!(
                "position {:.1}% exceeds max {:.1}%",
                pct, self.config.max_position_size_pct
            ))
        } else {
            None
        }
    }

    /// Daily-loss check: `-daily_realized / E <= max_daily_loss_pct`.
    pub fn check_daily_loss(&self, view: &RiskView) -> Option<String> {
        if view.equity <= Decimal::ZERO || view.daily_realized >= Decimal::ZERO {
            return None;
        }
        let loss_pct = -view.daily_realized / view.equity * Decimal::ONE_HUNDRED;
        if loss_pct > self.config.max_daily_loss_pct {
            Some(format!(
                "daily loss {:.1}% exceeds max {:.1}%",
                loss_pct, self.config.max_daily_loss_pct
            ))
        } else {
            None
        }
    }

    /// Run both exposure checks and join any violations into a single
    /// note for the approver.
    pub fn assess(&self, view: &RiskView, delta: Decimal) -> Option<String> {
        let notes: Vec<String> = [
            self.check_position_size(view, delta),
            self.check_daily_loss(view),
        ]
        .into_iter()
        .flatten()
        .collect();
        if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig::default())
    }

    fn info() -> ExchangeInfo {
        ExchangeInfo {
            min_qty: dec!(0.00001),
            step_size: dec!(0.00001),
            max_qty: dec!(9000),
            price_step: dec!(0.01),
        }
    }

    #[test]
    fn test_resolve_qty_basic() {
        // pips=1, multiplier=2.0, min_qty=0.00001 -> 0.00002
        let (qty, note) = engine().resolve_qty(&info(), dec!(1));
        assert_eq!(qty, dec!(0.00002));
        assert!(note.is_none());
    }

    #[test]
    fn test_resolve_qty_is_linear_in_pips() {
        let engine = engine();
        let info = info();
        let (unit, _) = engine.resolve_qty(&info, dec!(1));
        for k in 1..=20u32 {
            let k = Decimal::from(k);
            let (qty, _) = engine.resolve_qty(&info, k);
            assert_eq!(qty, k * unit);
        }
    }

    #[test]
    fn test_resolve_qty_clamps_above_max() {
        let mut info = info();
        info.max_qty = dec!(0.00003);
        let (qty, note) = engine().resolve_qty(&info, dec!(10));
        assert_eq!(qty, dec!(0.00003));
        assert!(note.unwrap().contains("above exchange max"));
    }

    #[test]
    fn test_resolve_qty_clamps_below_min() {
        let engine = RiskEngine::new(RiskConfig {
            pip_multiplier: dec!(0.1),
            ..RiskConfig::default()
        });
        let (qty, note) = engine.resolve_qty(&info(), dec!(0.1));
        assert_eq!(qty, dec!(0.00001));
        assert!(note.unwrap().contains("below exchange min"));
    }

    #[test]
    fn test_position_size_violation_message() {
        let view = RiskView {
            equity: dec!(100000),
            symbol_exposure: dec!(8000),
            daily_realized: dec!(0),
        };
        // 8000 + 4300 = 12.3% of 100k
        let note = engine().check_position_size(&view, dec!(4300)).unwrap();
        assert_eq!(note, "position 12.3% exceeds max 10.0%");
    }

    #[test]
    fn test_position_size_at_limit_passes() {
        let view = RiskView {
            equity: dec!(100000),
            symbol_exposure: dec!(5000),
            daily_realized: dec!(0),
        };
        assert!(engine().check_position_size(&view, dec!(5000)).is_none());
    }

    #[test]
    fn test_daily_loss_check() {
        let engine = engine();
        let ok = RiskView {
            equity: dec!(100000),
            symbol_exposure: dec!(0),
            daily_realized: dec!(-4000),
        };
        assert!(engine.check_daily_loss(&ok).is_none());

        let breached = RiskView {
            daily_realized: dec!(-6000),
            ..ok
        };
        let note = engine.check_daily_loss(&breached).unwrap();
        assert!(note.contains("daily loss"));
        assert!(note.contains("6.0%"));
    }

    #[test]
    fn test_profit_day_never_flags_loss() {
        let view = RiskView {
            equity: dec!(100000),
            symbol_exposure: dec!(0),
            daily_realized: dec!(25000),
        };
        assert!(engine().check_daily_loss(&view).is_none());
    }

    #[test]
    fn test_assess_joins_notes() {
        let view = RiskView {
            equity: dec!(100000),
            symbol_exposure: dec!(20000),
            daily_realized: dec!(-10000),
        };
        let note = engine().assess(&view, dec!(0)).unwrap();
        assert!(note.contains("position"));
        assert!(note.contains("; "));
        assert!(note.contains("daily loss"));
    }
}
