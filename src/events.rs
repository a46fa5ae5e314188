//! Event payloads flowing between components
//!
//! The execution engine publishes [`FillEvent`]s on a buffered channel
//! consumed by the coordinator; the approval queue publishes
//! [`PendingResolution`]s the pyramid manager reacts to. Neither side
//! imports the other's internals. Dashboard subscribers get the
//! best-effort [`BroadcastEvent`] stream.

use crate::types::{Liquidity, OrderSource, Side, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A fill appended to the SOT store, with enough order context for the
/// coordinator to project it without re-reading the order row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: i64,
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub source: OrderSource,
    pub source_ref: Option<String>,
    pub fill_qty: Decimal,
    /// Pre-slippage reference price.
    pub fill_price: Decimal,
    pub effective_price: Decimal,
    pub fees: Decimal,
    pub slippage_amount: Decimal,
    pub liquidity: Liquidity,
    pub filled_at: DateTime<Utc>,
}

impl FillEvent {
    pub fn is_pyramid(&self) -> bool {
        self.source_ref
            .as_deref()
            .map(|r| r.starts_with("pyramid:"))
            .unwrap_or(false)
    }
}

/// Outcome of an approval decision, emitted by the queue so the pyramid
/// manager can react to rejections of its own orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResolution {
    pub pending_id: i64,
    pub source: OrderSource,
    pub source_ref: Option<String>,
    pub approved: bool,
    pub reviewed_by: String,
    pub note: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Best-effort dashboard broadcast. Losing one of these is fine; the
/// stores remain the source of truth.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastEvent {
    PendingQueued {
        pending_id: i64,
        symbol: Symbol,
        source: OrderSource,
        risk_note: Option<String>,
    },
    PendingResolved {
        pending_id: i64,
        approved: bool,
    },
    Fill {
        order_id: i64,
        symbol: Symbol,
        side: Side,
        qty: Decimal,
        price: Decimal,
    },
    SessionUpdate {
        session_id: i64,
        status: String,
    },
}
