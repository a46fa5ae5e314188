//! Spreadsheet intake contract
//!
//! Upstream tooling exports the `purchase order` sheet as rows of
//! `(client_order_id, symbol, side?, qty, price)`. This module turns
//! those rows into order intents for the approval queue. Bad rows are
//! reported individually; the batch always continues.

use crate::store::sot::OrderIntent;
use crate::types::{OrderSource, OrderType, Side, Symbol};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Sheet the upstream exporter is expected to name.
pub const SHEET_NAME: &str = "purchase order";

/// One raw spreadsheet row. Everything arrives as text; validation
/// happens in [`rows_to_intents`].
#[derive(Debug, Clone, Deserialize)]
pub struct SheetRow {
    pub client_order_id: String,
    pub symbol: String,
    #[serde(default)]
    pub side: Option<String>,
    pub qty: String,
    pub price: String,
}

/// A row that failed validation, with its 0-based position.
#[derive(Debug, Clone)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.row, self.message)
    }
}

/// Side tokens: BUY/SELL plus the localized MUA/BAN pair,
/// case-insensitive. Missing defaults to BUY.
fn parse_side(token: Option<&str>) -> Result<Side, String> {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(Side::Buy);
    };
    match token.to_uppercase().as_str() {
        "BUY" | "MUA" => Ok(Side::Buy),
        "SELL" | "BÁN" | "BAN" => Ok(Side::Sell),
        other => Err(format!("unrecognized side token: {other}")),
    }
}

fn parse_row(row: &SheetRow) -> Result<OrderIntent, String> {
    if row.client_order_id.trim().is_empty() {
        return Err("missing client_order_id".to_string());
    }
    if row.symbol.trim().is_empty() {
        return Err("missing symbol".to_string());
    }
    let side = parse_side(row.side.as_deref())?;
    let qty = Decimal::from_str(row.qty.trim())
        .map_err(|_| format!("non-numeric qty: {}", row.qty))?;
    if qty <= Decimal::ZERO {
        return Err(format!("qty must be positive: {qty}"));
    }
    let price = Decimal::from_str(row.price.trim())
        .map_err(|_| format!("non-numeric price: {}", row.price))?;
    if price <= Decimal::ZERO {
        return Err(format!("price must be positive: {price}"));
    }

    Ok(OrderIntent {
        client_order_id: Some(row.client_order_id.trim().to_string()),
        symbol: Symbol::new(row.symbol.trim().to_uppercase()),
        side,
        order_type: OrderType::Limit,
        quantity: Some(qty),
        pips: None,
        price,
        stop_price: None,
        source: OrderSource::Spreadsheet,
        source_ref: Some(format!("sheet:{}", row.client_order_id.trim())),
        strategy_name: None,
        confidence: None,
    })
}

/// Convert a batch of rows, collecting per-row errors instead of
/// aborting.
pub fn rows_to_intents(rows: &[SheetRow]) -> (Vec<OrderIntent>, Vec<RowError>) {
    let mut intents = Vec::new();
    let mut errors = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        match parse_row(row) {
            Ok(intent) => intents.push(intent),
            Err(message) => {
                warn!("skipping sheet row {i}: {message}");
                errors.push(RowError { row: i, message });
            }
        }
    }
    (intents, errors)
}

/// Read a CSV export of the purchase-order sheet.
pub fn read_csv(path: impl AsRef<Path>) -> anyhow::Result<Vec<SheetRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}
