//! Persistence layer
//!
//! Two SQLite databases with different ownership rules: `sot.db` holds
//! the append-only facts (orders, events, fills, costs, pnl, the
//! approval queue, and pyramid session state), `ts.db` holds derived
//! aggregates that can always be rebuilt from the facts.

pub mod pyramid;
pub mod sot;
pub mod ts;

pub use pyramid::{NewSession, PyramidSession, PyramidWave, SessionStatus, WaveStatus};
pub use sot::{
    FillRecord, NewOrder, Order, OrderCost, OrderEvent, OrderIntent, OrderPnl, PendingFilter,
    PendingOrder, SotStore,
};
pub use ts::{Position, Trade, TradePnl, TradeStatus, TsStore};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rust_decimal::Decimal;
use rusqlite::types::Type;
use rusqlite::Row;
use std::str::FromStr;

/// Timestamps are stored as RFC3339 with millisecond precision, UTC.
/// The fixed format keeps string comparison consistent with time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn fmt_dec(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn ts_col(row: &Row, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| Utc.timestamp_millis_opt(dt.timestamp_millis()).unwrap())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

pub(crate) fn ts_col_opt(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(Utc.timestamp_millis_opt(dt.timestamp_millis()).unwrap()))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))),
    }
}

pub(crate) fn dec_col(row: &Row, col: &str) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(col)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

pub(crate) fn dec_col_opt(row: &Row, col: &str) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(col)?;
    match raw {
        None => Ok(None),
        Some(raw) => Decimal::from_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))),
    }
}

pub(crate) fn enum_col<T: FromStr<Err = String>>(row: &Row, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}
