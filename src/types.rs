//! Core data types used across the paper-trading system

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Trading pair symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Order type - determines execution logic
///
/// Market and limit orders execute at their accepted price as soon as the
/// engine releases them (after any configured latency). Stop-loss orders
/// stay armed until the scanner observes the trigger price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
        }
    }

    /// Stop orders wait for the trigger scan; everything else executes
    /// as soon as the engine releases it.
    pub fn is_armed(&self) -> bool {
        matches!(self, OrderType::StopLoss)
    }

    /// Default liquidity classification. Resting limit orders add
    /// liquidity; market and triggered stop orders take it.
    pub fn default_is_maker(&self) -> bool {
        matches!(self, OrderType::Limit)
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            "STOP_LOSS" => Ok(OrderType::StopLoss),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Where an order intent came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSource {
    Spreadsheet,
    Strategy,
    Pyramid,
    Backtest,
}

impl OrderSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSource::Spreadsheet => "SPREADSHEET",
            OrderSource::Strategy => "STRATEGY",
            OrderSource::Pyramid => "PYRAMID",
            OrderSource::Backtest => "BACKTEST",
        }
    }
}

impl FromStr for OrderSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SPREADSHEET" => Ok(OrderSource::Spreadsheet),
            "STRATEGY" => Ok(OrderSource::Strategy),
            "PYRAMID" => Ok(OrderSource::Pyramid),
            "BACKTEST" => Ok(OrderSource::Backtest),
            other => Err(format!("unknown order source: {other}")),
        }
    }
}

/// Liquidity flag on a fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liquidity {
    Maker,
    Taker,
}

impl Liquidity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liquidity::Maker => "MAKER",
            Liquidity::Taker => "TAKER",
        }
    }
}

impl FromStr for Liquidity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MAKER" => Ok(Liquidity::Maker),
            "TAKER" => Ok(Liquidity::Taker),
            other => Err(format!("unknown liquidity flag: {other}")),
        }
    }
}

/// Order state machine
///
/// ```text
/// NEW --(latency>0)--> PENDING --> (stop? TRIGGERED) --> PARTIALLY_FILLED* --> FILLED
///   \                     \                                                     ^
///    \                     +---------------- CANCELLED <-----------------------+
///     +--------------------------- CANCELLED
/// ```
///
/// Cancellation is terminal and only legal while quantity remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Pending,
    Triggered,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Triggered => "TRIGGERED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }

    /// Whether a transition along the status lattice is legal.
    ///
    /// A violation is a programming error at the store boundary, not a
    /// recoverable condition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if *self == next {
            // Repeated partial fills stay in PARTIALLY_FILLED.
            return matches!(next, PartiallyFilled);
        }
        match (*self, next) {
            (_, Cancelled) => !self.is_terminal(),
            (New, Pending) | (New, Triggered) | (New, PartiallyFilled) | (New, Filled) => true,
            (Pending, Triggered) | (Pending, PartiallyFilled) | (Pending, Filled) => true,
            (Triggered, PartiallyFilled) | (Triggered, Filled) => true,
            (PartiallyFilled, Filled) => true,
            _ => false,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(OrderStatus::New),
            "PENDING" => Ok(OrderStatus::Pending),
            "TRIGGERED" => Ok(OrderStatus::Triggered),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Pending-order approval state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "PENDING",
            PendingStatus::Approved => "APPROVED",
            PendingStatus::Rejected => "REJECTED",
            PendingStatus::Executed => "EXECUTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PendingStatus::Rejected | PendingStatus::Executed)
    }
}

impl FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(PendingStatus::Pending),
            "APPROVED" => Ok(PendingStatus::Approved),
            "REJECTED" => Ok(PendingStatus::Rejected),
            "EXECUTED" => Ok(PendingStatus::Executed),
            other => Err(format!("unknown pending status: {other}")),
        }
    }
}

/// Order lifecycle event kinds, append-only in the SOT store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventType {
    Created,
    Submitted,
    Triggered,
    PartialFill,
    Fill,
    Cancelled,
    Error,
    StopScanSkipped,
}

impl OrderEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventType::Created => "CREATED",
            OrderEventType::Submitted => "SUBMITTED",
            OrderEventType::Triggered => "TRIGGERED",
            OrderEventType::PartialFill => "PARTIAL_FILL",
            OrderEventType::Fill => "FILL",
            OrderEventType::Cancelled => "CANCELLED",
            OrderEventType::Error => "ERROR",
            OrderEventType::StopScanSkipped => "STOP_SCAN_SKIPPED",
        }
    }
}

impl FromStr for OrderEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(OrderEventType::Created),
            "SUBMITTED" => Ok(OrderEventType::Submitted),
            "TRIGGERED" => Ok(OrderEventType::Triggered),
            "PARTIAL_FILL" => Ok(OrderEventType::PartialFill),
            "FILL" => Ok(OrderEventType::Fill),
            "CANCELLED" => Ok(OrderEventType::Cancelled),
            "ERROR" => Ok(OrderEventType::Error),
            "STOP_SCAN_SKIPPED" => Ok(OrderEventType::StopScanSkipped),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lattice_forward_paths() {
        use OrderStatus::*;
        assert!(New.can_transition_to(Pending));
        assert!(New.can_transition_to(Filled));
        assert!(Pending.can_transition_to(Triggered));
        assert!(Triggered.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Filled));
    }

    #[test]
    fn test_status_lattice_rejects_backward_paths() {
        use OrderStatus::*;
        assert!(!Filled.can_transition_to(New));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Filled));
        assert!(!PartiallyFilled.can_transition_to(New));
        assert!(!Triggered.can_transition_to(Pending));
    }

    #[test]
    fn test_cancel_allowed_from_any_live_state() {
        use OrderStatus::*;
        for state in [New, Pending, Triggered, PartiallyFilled] {
            assert!(state.can_transition_to(Cancelled), "{state:?}");
        }
    }

    #[test]
    fn test_enum_string_round_trips() {
        for status in [
            OrderStatus::New,
            OrderStatus::Pending,
            OrderStatus::Triggered,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        for source in [
            OrderSource::Spreadsheet,
            OrderSource::Strategy,
            OrderSource::Pyramid,
            OrderSource::Backtest,
        ] {
            assert_eq!(source.as_str().parse::<OrderSource>().unwrap(), source);
        }
    }
}
