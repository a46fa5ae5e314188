//! Session parameters and wave math
//!
//! Wave targets are deterministic functions of the session parameters:
//!
//! ```text
//! target_qty(n)   = (n + 1) x pip_size
//! target_price(n) = entry_price x (1 - distance_pct/100)^n
//! ```
//!
//! The price exponential runs in f64 and is quantized onto the price
//! step immediately; quantities stay in the decimal domain throughout.

use crate::money::{decimal_from_f64, round_to_step};
use crate::price_source::ExchangeInfo;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Parameters for creating a pyramid session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub symbol: String,
    pub entry_price: Decimal,
    /// Distance between waves, percent per step.
    pub distance_pct: Decimal,
    pub max_waves: i64,
    /// Upper bound on committed capital; exceeding the estimate flags
    /// the session but does not block creation.
    pub isolated_fund: Decimal,
    pub tp_pct: Decimal,
    pub timeout_min: i64,
    /// Minimum spacing between wave enqueues.
    pub gap_min: i64,
    pub pip_multiplier: Decimal,
}

/// Partial update for a live session; `None` keeps the current value.
/// Only unfilled waves are reshaped - filled waves are facts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdjustParams {
    pub distance_pct: Option<Decimal>,
    pub max_waves: Option<i64>,
    pub tp_pct: Option<Decimal>,
    pub timeout_min: Option<i64>,
    pub gap_min: Option<i64>,
}

/// One pip of size for a session: `pip_multiplier x exchange min_qty`,
/// on the step grid.
pub fn pip_size(pip_multiplier: Decimal, info: &ExchangeInfo) -> Decimal {
    let raw = pip_multiplier * info.min_qty;
    let sized = round_to_step(raw, info.step_size);
    if sized < info.min_qty {
        info.min_qty
    } else {
        sized
    }
}

pub fn wave_target_qty(wave_num: i64, pip: Decimal, info: &ExchangeInfo) -> Decimal {
    round_to_step(Decimal::from(wave_num + 1) * pip, info.step_size)
}

pub fn wave_target_price(
    entry_price: Decimal,
    distance_pct: Decimal,
    wave_num: i64,
    info: &ExchangeInfo,
) -> Decimal {
    if wave_num == 0 || distance_pct.is_zero() {
        return round_to_step(entry_price, info.price_step);
    }
    let factor = 1.0 - distance_pct.to_f64().unwrap_or(0.0) / 100.0;
    let price = entry_price.to_f64().unwrap_or(0.0) * factor.powi(wave_num as i32);
    round_to_step(decimal_from_f64(price), info.price_step)
}

/// Capital required if every wave fills at its target.
pub fn estimated_cost(params: &SessionParams, info: &ExchangeInfo) -> Decimal {
    let pip = pip_size(params.pip_multiplier, info);
    (0..params.max_waves)
        .map(|n| {
            wave_target_qty(n, pip, info)
                * wave_target_price(params.entry_price, params.distance_pct, n, info)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn info() -> ExchangeInfo {
        ExchangeInfo {
            min_qty: dec!(0.00001),
            step_size: dec!(0.00001),
            max_qty: dec!(9000),
            price_step: dec!(0.01),
        }
    }

    fn params() -> SessionParams {
        SessionParams {
            symbol: "BTCUSDT".to_string(),
            entry_price: dec!(50000),
            distance_pct: dec!(2),
            max_waves: 3,
            isolated_fund: dec!(10),
            tp_pct: dec!(3),
            timeout_min: 60,
            gap_min: 0,
            pip_multiplier: dec!(2),
        }
    }

    #[test]
    fn test_wave_targets_match_reference_ladder() {
        let info = info();
        let p = params();
        let pip = pip_size(p.pip_multiplier, &info);
        assert_eq!(pip, dec!(0.00002));

        assert_eq!(wave_target_qty(0, pip, &info), dec!(0.00002));
        assert_eq!(wave_target_qty(1, pip, &info), dec!(0.00004));
        assert_eq!(wave_target_qty(2, pip, &info), dec!(0.00006));

        assert_eq!(
            wave_target_price(p.entry_price, p.distance_pct, 0, &info),
            dec!(50000)
        );
        assert_eq!(
            wave_target_price(p.entry_price, p.distance_pct, 1, &info),
            dec!(49000)
        );
        assert_eq!(
            wave_target_price(p.entry_price, p.distance_pct, 2, &info),
            dec!(48020)
        );
    }

    #[test]
    fn test_wave_prices_strictly_decrease() {
        let info = info();
        let p = params();
        let mut prev = wave_target_price(p.entry_price, p.distance_pct, 0, &info);
        for n in 1..10 {
            let price = wave_target_price(p.entry_price, p.distance_pct, n, &info);
            assert!(price < prev, "wave {n}: {price} >= {prev}");
            prev = price;
        }
    }

    #[test]
    fn test_zero_distance_keeps_entry_price() {
        let info = info();
        for n in 0..5 {
            assert_eq!(
                wave_target_price(dec!(50000), dec!(0), n, &info),
                dec!(50000)
            );
        }
    }

    #[test]
    fn test_estimated_cost_sums_ladder() {
        let info = info();
        let p = params();
        // 0.00002*50000 + 0.00004*49000 + 0.00006*48020
        let expected = dec!(1) + dec!(1.96) + dec!(2.8812);
        assert_eq!(estimated_cost(&p, &info), expected);
    }

    #[test]
    fn test_pip_size_never_below_min_qty() {
        let info = info();
        assert_eq!(pip_size(dec!(0.1), &info), dec!(0.00001));
    }
}
