//! Typed error taxonomy for the core
//!
//! Errors cross component boundaries as values, never as panics. Risk
//! violations are deliberately absent: they annotate a pending order's
//! `risk_note` and the order still queues.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input caught at a boundary; no state change.
    #[error("validation: {0}")]
    Validation(String),

    /// Optimistic-concurrency conflict or illegal state transition;
    /// the caller may retry against fresh state.
    #[error("stale state: {0}")]
    StaleState(String),

    /// SELL exceeds the owned quantity; the order is cancelled with an
    /// ERROR event.
    #[error("insufficient position: have {have}, need {need}")]
    InsufficientPosition { have: Decimal, need: Decimal },

    /// The price feed is down or stale past its freshness bound.
    /// Recoverable: stop scans and mark-to-market skip this tick.
    #[error("price source unavailable: {0}")]
    PriceSourceUnavailable(String),

    /// Transaction failure or constraint violation in a store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Lattice violation or similar programming error. Fatal: writes
    /// pause and an operator has to look.
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        CoreError::StaleState(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }

    /// Fatal errors pause the component that hit them; everything else
    /// is surfaced to the caller and life goes on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Internal(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("event payload encoding: {err}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::internal("boom").is_fatal());
        assert!(!CoreError::validation("bad qty").is_fatal());
        assert!(!CoreError::InsufficientPosition {
            have: dec!(5),
            need: dec!(10)
        }
        .is_fatal());
    }

    #[test]
    fn test_display_includes_quantities() {
        let err = CoreError::InsufficientPosition {
            have: dec!(5),
            need: dec!(10),
        };
        let msg = err.to_string();
        assert!(msg.contains('5') && msg.contains("10"));
    }
}
