//! Trade Service store
//!
//! Derived aggregates: positions, trades, and per-trade PnL snapshots.
//! Strictly a consumer of SOT facts - every row here can be rebuilt by
//! replaying fills, which is the crash-recovery story. Lives in its own
//! database file with its own connection so it can fail and be rebuilt
//! independently of the fact store.

use crate::error::{CoreError, CoreResult};
use crate::events::FillEvent;
use crate::store::sot::SotStore;
use crate::store::{dec_col, dec_col_opt, enum_col, fmt_dec, fmt_ts, ts_col, ts_col_opt};
use crate::types::{Side, Symbol};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

// =============================================================================
// Data Models
// =============================================================================

/// Net position per symbol.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub total_cost: Decimal,
    pub realized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    fn flat(symbol: Symbol, now: DateTime<Utc>) -> Self {
        Position {
            symbol,
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            updated_at: now,
        }
    }

    /// Mark-to-market valuation at a given price.
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.avg_entry_price) * self.quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    Partial,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Partial => "PARTIAL",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(TradeStatus::Open),
            "PARTIAL" => Ok(TradeStatus::Partial),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("unknown trade status: {other}")),
        }
    }
}

/// Entry/exit aggregation of fills into a round trip.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: i64,
    pub entry_order_id: i64,
    pub exit_order_id: Option<i64>,
    pub symbol: Symbol,
    pub side: Side,
    pub status: TradeStatus,
    pub entry_qty: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_qty: Decimal,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub current_qty: Decimal,
    /// Accumulated exactly per exit fill, not recomputed from averages.
    pub gross_pnl: Decimal,
    pub entry_fees: Decimal,
    pub exit_fees: Decimal,
    pub strategy_code: Option<String>,
}

/// Derived PnL snapshot per trade.
#[derive(Debug, Clone)]
pub struct TradePnl {
    pub trade_id: i64,
    pub gross_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub return_pct: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub duration_s: i64,
}

// =============================================================================
// Store
// =============================================================================

pub struct TsStore {
    conn: Arc<Mutex<Connection>>,
}

impl TsStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> CoreResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::internal(format!("create store dir: {e}")))?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("TS store initialized");
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn create_tables(&self) -> CoreResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                quantity TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL,
                total_cost TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_order_id INTEGER NOT NULL,
                exit_order_id INTEGER,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                entry_qty TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_qty TEXT NOT NULL DEFAULT '0',
                exit_price TEXT,
                exit_time TEXT,
                current_qty TEXT NOT NULL,
                gross_pnl TEXT NOT NULL DEFAULT '0',
                entry_fees TEXT NOT NULL DEFAULT '0',
                exit_fees TEXT NOT NULL DEFAULT '0',
                strategy_code TEXT
            );

            CREATE TABLE IF NOT EXISTS trade_pnl (
                trade_id INTEGER PRIMARY KEY REFERENCES trades(id),
                gross_pnl TEXT NOT NULL,
                total_fees TEXT NOT NULL,
                net_pnl TEXT NOT NULL,
                return_pct TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                duration_s INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trades_symbol_status
                ON trades(symbol, status);",
        )?;
        debug!("TS schema created/verified");
        Ok(())
    }

    /// Project one fill into positions, trades, and trade PnL. All
    /// mutations for a single fill commit atomically.
    pub fn apply_fill(&self, event: &FillEvent) -> CoreResult<()> {
        match event.side {
            Side::Buy => self.open_trade(event),
            Side::Sell => self.close_trade(event),
        }
    }

    /// BUY fill: grow the position and open (or accumulate into) the
    /// symbol's live trade.
    pub fn open_trade(&self, event: &FillEvent) -> CoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut pos = read_position(&tx, &event.symbol)?
            .unwrap_or_else(|| Position::flat(event.symbol.clone(), event.filled_at));
        let new_qty = pos.quantity + event.fill_qty;
        // avg resets to the fresh entry price when re-entering from flat.
        pos.avg_entry_price = if pos.quantity.is_zero() {
            event.effective_price
        } else {
            (pos.quantity * pos.avg_entry_price + event.fill_qty * event.effective_price) / new_qty
        };
        pos.quantity = new_qty;
        pos.total_cost += event.fill_qty * event.effective_price + event.fees;
        pos.updated_at = event.filled_at;
        write_position(&tx, &pos)?;

        let live = read_live_trade(&tx, &event.symbol)?;
        match live {
            Some(mut trade) => {
                let new_entry_qty = trade.entry_qty + event.fill_qty;
                trade.entry_price = (trade.entry_qty * trade.entry_price
                    + event.fill_qty * event.effective_price)
                    / new_entry_qty;
                trade.entry_qty = new_entry_qty;
                trade.current_qty += event.fill_qty;
                trade.entry_fees += event.fees;
                update_trade(&tx, &trade)?;
            }
            None => {
                tx.execute(
                    "INSERT INTO trades
                     (entry_order_id, symbol, side, status, entry_qty,
                      entry_price, entry_time, current_qty, entry_fees,
                      strategy_code)
                     VALUES (?1, ?2, ?3, 'OPEN', ?4, ?5, ?6, ?4, ?7, ?8)",
                    params![
                        event.order_id,
                        event.symbol.as_str(),
                        event.side.as_str(),
                        fmt_dec(event.fill_qty),
                        fmt_dec(event.effective_price),
                        fmt_ts(event.filled_at),
                        fmt_dec(event.fees),
                        event.source_ref,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// SELL fill: realize PnL against the position average and close
    /// (part of) the live trade.
    pub fn close_trade(&self, event: &FillEvent) -> CoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut pos = read_position(&tx, &event.symbol)?
            .unwrap_or_else(|| Position::flat(event.symbol.clone(), event.filled_at));

        // The engine validates SELL quantity before the fill exists; a
        // shortfall here means the derived state has diverged from the
        // facts and needs a rebuild.
        let mut fill_qty = event.fill_qty;
        if pos.quantity < fill_qty {
            error!(
                "position {} short on rebuild: have {}, sell fill {} (order {})",
                event.symbol, pos.quantity, fill_qty, event.order_id
            );
            fill_qty = pos.quantity;
        }

        let realized = (event.effective_price - pos.avg_entry_price) * fill_qty - event.fees;
        pos.realized_pnl += realized;
        pos.quantity -= fill_qty;
        if pos.quantity.is_zero() {
            pos.avg_entry_price = Decimal::ZERO;
            pos.total_cost = Decimal::ZERO;
        } else {
            pos.total_cost -= fill_qty * pos.avg_entry_price;
        }
        pos.updated_at = event.filled_at;
        write_position(&tx, &pos)?;

        let live = read_live_trade(&tx, &event.symbol)?;
        if let Some(mut trade) = live {
            let gross_delta = (event.effective_price - trade.entry_price) * fill_qty;
            trade.gross_pnl += gross_delta;
            trade.exit_price = Some(match (trade.exit_price, trade.exit_qty.is_zero()) {
                (Some(prev), false) => {
                    (trade.exit_qty * prev + fill_qty * event.effective_price)
                        / (trade.exit_qty + fill_qty)
                }
                _ => event.effective_price,
            });
            trade.exit_qty += fill_qty;
            trade.current_qty -= fill_qty;
            trade.exit_fees += event.fees;
            trade.exit_time = Some(event.filled_at);
            if trade.current_qty <= Decimal::ZERO {
                trade.current_qty = Decimal::ZERO;
                trade.status = TradeStatus::Closed;
                trade.exit_order_id = Some(event.order_id);
            } else {
                trade.status = TradeStatus::Partial;
            }
            update_trade(&tx, &trade)?;
            write_trade_pnl(&tx, &trade)?;
        } else {
            warn!(
                "sell fill on {} without an open trade (order {})",
                event.symbol, event.order_id
            );
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_trade(&self, id: i64) -> CoreResult<Option<Trade>> {
        self.lock()
            .query_row("SELECT * FROM trades WHERE id = ?1", params![id], map_trade)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_trades(&self, status: Option<TradeStatus>) -> CoreResult<Vec<Trade>> {
        let conn = self.lock();
        let mut trades = Vec::new();
        match status {
            Some(status) => {
                let mut stmt =
                    conn.prepare("SELECT * FROM trades WHERE status = ?1 ORDER BY id ASC")?;
                for row in stmt.query_map(params![status.as_str()], map_trade)? {
                    trades.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM trades ORDER BY id ASC")?;
                for row in stmt.query_map([], map_trade)? {
                    trades.push(row?);
                }
            }
        }
        Ok(trades)
    }

    pub fn get_trade_pnl(&self, trade_id: i64) -> CoreResult<Option<TradePnl>> {
        self.lock()
            .query_row(
                "SELECT * FROM trade_pnl WHERE trade_id = ?1",
                params![trade_id],
                map_trade_pnl,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_position(&self, symbol: &Symbol) -> CoreResult<Option<Position>> {
        self.lock()
            .query_row(
                "SELECT * FROM positions WHERE symbol = ?1",
                params![symbol.as_str()],
                map_position,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_positions(&self) -> CoreResult<Vec<Position>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM positions ORDER BY symbol ASC")?;
        let rows = stmt
            .query_map([], map_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total realized PnL across all positions.
    pub fn get_total_pnl(&self) -> CoreResult<Decimal> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT realized_pnl FROM positions")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut total = Decimal::ZERO;
        for raw in rows {
            total += raw
                .parse::<Decimal>()
                .map_err(|e| CoreError::internal(format!("corrupt realized_pnl {raw}: {e}")))?;
        }
        Ok(total)
    }

    /// Rebuild the derived state by replaying SOT fills in append order.
    ///
    /// With `since = None` the derived tables are cleared first; with a
    /// timestamp, only later fills are applied on top of current state.
    pub fn rebuild_from_sot(
        &self,
        sot: &SotStore,
        since: Option<DateTime<Utc>>,
    ) -> CoreResult<usize> {
        if since.is_none() {
            let conn = self.lock();
            conn.execute_batch(
                "DELETE FROM trade_pnl; DELETE FROM trades; DELETE FROM positions;",
            )?;
        }

        let orders: HashMap<i64, crate::store::sot::Order> = sot
            .list_orders(None, None)?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();

        let mut applied = 0;
        for fill in sot.list_all_fills()? {
            if let Some(since) = since {
                if fill.filled_at < since {
                    continue;
                }
            }
            let order = orders.get(&fill.order_id).ok_or_else(|| {
                CoreError::internal(format!("fill {} references missing order", fill.id))
            })?;
            let event = FillEvent {
                fill_id: fill.id,
                order_id: order.id,
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                source: order.source,
                source_ref: order.source_ref.clone(),
                fill_qty: fill.fill_qty,
                fill_price: fill.fill_price,
                effective_price: fill.effective_price,
                fees: fill.fees,
                slippage_amount: fill.slippage_amount,
                liquidity: fill.liquidity,
                filled_at: fill.filled_at,
            };
            self.apply_fill(&event)?;
            applied += 1;
        }
        info!("TS rebuild applied {applied} fills");
        Ok(applied)
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn read_position(
    tx: &rusqlite::Transaction<'_>,
    symbol: &Symbol,
) -> rusqlite::Result<Option<Position>> {
    tx.query_row(
        "SELECT * FROM positions WHERE symbol = ?1",
        params![symbol.as_str()],
        map_position,
    )
    .optional()
}

fn write_position(tx: &rusqlite::Transaction<'_>, pos: &Position) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO positions
         (symbol, quantity, avg_entry_price, total_cost, realized_pnl, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            pos.symbol.as_str(),
            fmt_dec(pos.quantity),
            fmt_dec(pos.avg_entry_price),
            fmt_dec(pos.total_cost),
            fmt_dec(pos.realized_pnl),
            fmt_ts(pos.updated_at),
        ],
    )?;
    Ok(())
}

fn read_live_trade(
    tx: &rusqlite::Transaction<'_>,
    symbol: &Symbol,
) -> rusqlite::Result<Option<Trade>> {
    tx.query_row(
        "SELECT * FROM trades
         WHERE symbol = ?1 AND status IN ('OPEN', 'PARTIAL')
         ORDER BY id ASC LIMIT 1",
        params![symbol.as_str()],
        map_trade,
    )
    .optional()
}

fn update_trade(tx: &rusqlite::Transaction<'_>, trade: &Trade) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE trades
         SET exit_order_id = ?1, status = ?2, entry_qty = ?3, entry_price = ?4,
             exit_qty = ?5, exit_price = ?6, exit_time = ?7, current_qty = ?8,
             gross_pnl = ?9, entry_fees = ?10, exit_fees = ?11
         WHERE id = ?12",
        params![
            trade.exit_order_id,
            trade.status.as_str(),
            fmt_dec(trade.entry_qty),
            fmt_dec(trade.entry_price),
            fmt_dec(trade.exit_qty),
            trade.exit_price.map(fmt_dec),
            trade.exit_time.map(fmt_ts),
            fmt_dec(trade.current_qty),
            fmt_dec(trade.gross_pnl),
            fmt_dec(trade.entry_fees),
            fmt_dec(trade.exit_fees),
            trade.id,
        ],
    )?;
    Ok(())
}

fn write_trade_pnl(tx: &rusqlite::Transaction<'_>, trade: &Trade) -> rusqlite::Result<()> {
    let total_fees = trade.entry_fees + trade.exit_fees;
    let net_pnl = trade.gross_pnl - total_fees;
    let cost_basis = trade.entry_qty * trade.entry_price;
    let return_pct = if cost_basis.is_zero() {
        Decimal::ZERO
    } else {
        net_pnl / cost_basis * Decimal::ONE_HUNDRED
    };
    let duration_s = match trade.exit_time {
        Some(exit) => (exit - trade.entry_time).num_seconds(),
        None => 0,
    };
    tx.execute(
        "INSERT OR REPLACE INTO trade_pnl
         (trade_id, gross_pnl, total_fees, net_pnl, return_pct,
          realized_pnl, unrealized_pnl, duration_s)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, '0', ?7)",
        params![
            trade.id,
            fmt_dec(trade.gross_pnl),
            fmt_dec(total_fees),
            fmt_dec(net_pnl),
            fmt_dec(return_pct),
            fmt_dec(net_pnl),
            duration_s,
        ],
    )?;
    Ok(())
}

fn map_position(row: &Row) -> rusqlite::Result<Position> {
    Ok(Position {
        symbol: Symbol::new(row.get::<_, String>("symbol")?),
        quantity: dec_col(row, "quantity")?,
        avg_entry_price: dec_col(row, "avg_entry_price")?,
        total_cost: dec_col(row, "total_cost")?,
        realized_pnl: dec_col(row, "realized_pnl")?,
        updated_at: ts_col(row, "updated_at")?,
    })
}

fn map_trade(row: &Row) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get("id")?,
        entry_order_id: row.get("entry_order_id")?,
        exit_order_id: row.get("exit_order_id")?,
        symbol: Symbol::new(row.get::<_, String>("symbol")?),
        side: enum_col(row, "side")?,
        status: enum_col(row, "status")?,
        entry_qty: dec_col(row, "entry_qty")?,
        entry_price: dec_col(row, "entry_price")?,
        entry_time: ts_col(row, "entry_time")?,
        exit_qty: dec_col(row, "exit_qty")?,
        exit_price: dec_col_opt(row, "exit_price")?,
        exit_time: ts_col_opt(row, "exit_time")?,
        current_qty: dec_col(row, "current_qty")?,
        gross_pnl: dec_col(row, "gross_pnl")?,
        entry_fees: dec_col(row, "entry_fees")?,
        exit_fees: dec_col(row, "exit_fees")?,
        strategy_code: row.get("strategy_code")?,
    })
}

fn map_trade_pnl(row: &Row) -> rusqlite::Result<TradePnl> {
    Ok(TradePnl {
        trade_id: row.get("trade_id")?,
        gross_pnl: dec_col(row, "gross_pnl")?,
        total_fees: dec_col(row, "total_fees")?,
        net_pnl: dec_col(row, "net_pnl")?,
        return_pct: dec_col(row, "return_pct")?,
        realized_pnl: dec_col(row, "realized_pnl")?,
        unrealized_pnl: dec_col(row, "unrealized_pnl")?,
        duration_s: row.get("duration_s")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Liquidity, OrderSource};
    use rust_decimal_macros::dec;

    fn fill(
        order_id: i64,
        side: Side,
        qty: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> FillEvent {
        FillEvent {
            fill_id: order_id * 10,
            order_id,
            client_order_id: format!("co-{order_id}"),
            symbol: Symbol::new("BTCUSDT"),
            side,
            source: OrderSource::Strategy,
            source_ref: None,
            fill_qty: qty,
            fill_price: price,
            effective_price: price,
            fees,
            slippage_amount: dec!(0),
            liquidity: Liquidity::Taker,
            filled_at: Utc::now(),
        }
    }

    #[test]
    fn test_buy_then_sell_flat_is_pnl_neutral() {
        let ts = TsStore::open_in_memory().unwrap();
        ts.apply_fill(&fill(1, Side::Buy, dec!(2), dec!(100), dec!(0)))
            .unwrap();
        ts.apply_fill(&fill(2, Side::Sell, dec!(2), dec!(100), dec!(0)))
            .unwrap();

        let pos = ts.get_position(&Symbol::new("BTCUSDT")).unwrap().unwrap();
        assert_eq!(pos.quantity, dec!(0));
        assert_eq!(pos.avg_entry_price, dec!(0));
        assert_eq!(pos.realized_pnl, dec!(0));
    }

    #[test]
    fn test_scale_out_realized_pnl_sequence() {
        let ts = TsStore::open_in_memory().unwrap();
        let symbol = Symbol::new("BTCUSDT");
        ts.apply_fill(&fill(1, Side::Buy, dec!(10), dec!(100), dec!(0)))
            .unwrap();

        let sells = [
            (dec!(3), dec!(110), dec!(30)),
            (dec!(4), dec!(120), dec!(110)),
            (dec!(2), dec!(130), dec!(170)),
            (dec!(1), dec!(140), dec!(210)),
        ];
        for (i, (qty, price, expected_realized)) in sells.iter().enumerate() {
            ts.apply_fill(&fill(10 + i as i64, Side::Sell, *qty, *price, dec!(0)))
                .unwrap();
            let pos = ts.get_position(&symbol).unwrap().unwrap();
            assert_eq!(pos.realized_pnl, *expected_realized);
        }

        let pos = ts.get_position(&symbol).unwrap().unwrap();
        assert_eq!(pos.quantity, dec!(0));
        assert_eq!(pos.avg_entry_price, dec!(0));

        let trades = ts.list_trades(None).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::Closed);
        assert_eq!(trades[0].gross_pnl, dec!(210));

        let pnl = ts.get_trade_pnl(trades[0].id).unwrap().unwrap();
        assert_eq!(pnl.net_pnl, dec!(210));
        assert_eq!(pnl.gross_pnl - pnl.total_fees, pnl.net_pnl);
    }

    #[test]
    fn test_trade_status_progression() {
        let ts = TsStore::open_in_memory().unwrap();
        ts.apply_fill(&fill(1, Side::Buy, dec!(10), dec!(100), dec!(0)))
            .unwrap();
        let trades = ts.list_trades(None).unwrap();
        assert_eq!(trades[0].status, TradeStatus::Open);

        ts.apply_fill(&fill(2, Side::Sell, dec!(4), dec!(110), dec!(0)))
            .unwrap();
        let trades = ts.list_trades(None).unwrap();
        assert_eq!(trades[0].status, TradeStatus::Partial);

        ts.apply_fill(&fill(3, Side::Sell, dec!(6), dec!(110), dec!(0)))
            .unwrap();
        let trades = ts.list_trades(None).unwrap();
        assert_eq!(trades[0].status, TradeStatus::Closed);
        assert_eq!(trades[0].exit_order_id, Some(3));
    }

    #[test]
    fn test_fees_reduce_net_and_realized() {
        let ts = TsStore::open_in_memory().unwrap();
        ts.apply_fill(&fill(1, Side::Buy, dec!(1), dec!(100), dec!(2)))
            .unwrap();
        ts.apply_fill(&fill(2, Side::Sell, dec!(1), dec!(110), dec!(3)))
            .unwrap();

        let pos = ts.get_position(&Symbol::new("BTCUSDT")).unwrap().unwrap();
        // Realized on the sell: (110-100)*1 - 3 = 7; buy fee sits in
        // total_cost, not realized.
        assert_eq!(pos.realized_pnl, dec!(7));

        let trades = ts.list_trades(None).unwrap();
        let pnl = ts.get_trade_pnl(trades[0].id).unwrap().unwrap();
        assert_eq!(pnl.gross_pnl, dec!(10));
        assert_eq!(pnl.total_fees, dec!(5));
        assert_eq!(pnl.net_pnl, dec!(5));
        assert_eq!(pnl.return_pct, dec!(5));
    }

    #[test]
    fn test_avg_resets_after_flat_reentry() {
        let ts = TsStore::open_in_memory().unwrap();
        let symbol = Symbol::new("BTCUSDT");
        ts.apply_fill(&fill(1, Side::Buy, dec!(1), dec!(100), dec!(0)))
            .unwrap();
        ts.apply_fill(&fill(2, Side::Sell, dec!(1), dec!(120), dec!(0)))
            .unwrap();
        ts.apply_fill(&fill(3, Side::Buy, dec!(1), dec!(80), dec!(0)))
            .unwrap();

        let pos = ts.get_position(&symbol).unwrap().unwrap();
        assert_eq!(pos.avg_entry_price, dec!(80));
        assert_eq!(pos.quantity, dec!(1));
        // Realized from the first round trip survives re-entry.
        assert_eq!(pos.realized_pnl, dec!(20));
    }
}
