//! Monetary arithmetic helpers
//!
//! Every price, quantity, fee, and PnL figure in the system is a
//! `rust_decimal::Decimal`. Addition and multiplication are exact;
//! anything that must land on an exchange step grid goes through
//! [`round_to_step`], which divides toward nearest even. Binary floats
//! appear only in transient indicator math (wave-price exponentiation,
//! progress percentages) and are quantized immediately via
//! [`decimal_from_f64`].

use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};

/// Quantize a value onto a step grid using banker's rounding.
///
/// `round_to_step(0.00123, 0.0005)` = `0.001`; ties go to the even
/// multiple. A non-positive step returns the value unchanged.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
    (steps * step).normalize()
}

/// Round down to the step grid. Used where exceeding a fund cap or a
/// remaining quantity would violate an invariant.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).floor();
    (steps * step).normalize()
}

/// Convert transient float math back into the decimal domain.
///
/// Falls back to zero on NaN/infinity; callers validate range separately.
pub fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// `pct` of `value`, where `pct` is expressed in percent units (10.0 = 10%).
pub fn percent_of(value: Decimal, pct: Decimal) -> Decimal {
    value * pct / Decimal::ONE_HUNDRED
}

/// Exact-compare helper for "within one step" tolerances at store
/// boundaries.
pub fn within_step_tolerance(a: Decimal, b: Decimal, step: Decimal) -> bool {
    let diff = (a - b).abs();
    if step <= Decimal::ZERO {
        diff.is_zero()
    } else {
        diff <= step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_step_basic() {
        assert_eq!(round_to_step(dec!(1.2349), dec!(0.001)), dec!(1.235));
        assert_eq!(round_to_step(dec!(0.00123), dec!(0.0005)), dec!(0.001));
        assert_eq!(round_to_step(dec!(10), dec!(0.01)), dec!(10));
    }

    #[test]
    fn test_round_to_step_bankers_ties() {
        // 0.0015 / 0.001 = 1.5 -> rounds to the even multiple (2)
        assert_eq!(round_to_step(dec!(0.0015), dec!(0.001)), dec!(0.002));
        // 0.0025 / 0.001 = 2.5 -> stays at the even multiple (2)
        assert_eq!(round_to_step(dec!(0.0025), dec!(0.001)), dec!(0.002));
    }

    #[test]
    fn test_round_to_step_zero_step_passthrough() {
        assert_eq!(round_to_step(dec!(1.23456), Decimal::ZERO), dec!(1.23456));
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(1.2399), dec!(0.01)), dec!(1.23));
        assert_eq!(floor_to_step(dec!(0.00009), dec!(0.00001)), dec!(0.00009));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(dec!(50000), dec!(2)), dec!(1000));
        assert_eq!(percent_of(dec!(100), dec!(0)), dec!(0));
    }

    #[test]
    fn test_decimal_from_f64_guards() {
        assert_eq!(decimal_from_f64(f64::NAN), Decimal::ZERO);
        assert_eq!(decimal_from_f64(0.5), dec!(0.5));
    }

    #[test]
    fn test_within_step_tolerance() {
        assert!(within_step_tolerance(dec!(1.000), dec!(1.001), dec!(0.001)));
        assert!(!within_step_tolerance(dec!(1.000), dec!(1.01), dec!(0.001)));
    }
}
