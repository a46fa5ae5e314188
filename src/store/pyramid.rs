//! Pyramid session persistence
//!
//! Session and wave rows live in `sot.db` next to the facts they hang
//! off, but they are mutable aggregates owned by the pyramid manager -
//! not facts - so the append-only guarantee does not cover them. All
//! status moves go through CAS updates keyed on the current status.

use crate::error::{CoreError, CoreResult};
use crate::store::sot::SotStore;
use crate::store::{dec_col, dec_col_opt, enum_col, fmt_dec, fmt_ts, ts_col, ts_col_opt};
use crate::types::Symbol;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Pyramid session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Active,
    TpTriggered,
    Stopped,
    Timeout,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::TpTriggered => "TP_TRIGGERED",
            SessionStatus::Stopped => "STOPPED",
            SessionStatus::Timeout => "TIMEOUT",
            SessionStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Timeout | SessionStatus::Completed
        )
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(SessionStatus::Pending),
            "ACTIVE" => Ok(SessionStatus::Active),
            "TP_TRIGGERED" => Ok(SessionStatus::TpTriggered),
            "STOPPED" => Ok(SessionStatus::Stopped),
            "TIMEOUT" => Ok(SessionStatus::Timeout),
            "COMPLETED" => Ok(SessionStatus::Completed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Wave lifecycle within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaveStatus {
    Pending,
    Queued,
    Filled,
    Cancelled,
}

impl WaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaveStatus::Pending => "PENDING",
            WaveStatus::Queued => "QUEUED",
            WaveStatus::Filled => "FILLED",
            WaveStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for WaveStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(WaveStatus::Pending),
            "QUEUED" => Ok(WaveStatus::Queued),
            "FILLED" => Ok(WaveStatus::Filled),
            "CANCELLED" => Ok(WaveStatus::Cancelled),
            other => Err(format!("unknown wave status: {other}")),
        }
    }
}

/// A pyramid DCA session row.
#[derive(Debug, Clone)]
pub struct PyramidSession {
    pub id: i64,
    pub symbol: Symbol,
    pub entry_price: Decimal,
    pub distance_pct: Decimal,
    pub max_waves: i64,
    pub isolated_fund: Decimal,
    pub tp_pct: Decimal,
    pub timeout_min: i64,
    pub gap_min: i64,
    pub pip_multiplier: Decimal,
    pub status: SessionStatus,
    /// Estimated cost exceeded the isolated fund at creation.
    pub flagged: bool,
    pub stop_reason: Option<String>,
    /// Number of filled waves; also the index of the next wave to fill.
    pub current_wave: i64,
    pub total_filled_qty: Decimal,
    pub total_cost: Decimal,
    pub avg_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_fill_at: Option<DateTime<Utc>>,
    pub last_wave_queued_at: Option<DateTime<Utc>>,
}

/// A single DCA leg.
#[derive(Debug, Clone)]
pub struct PyramidWave {
    pub id: i64,
    pub session_id: i64,
    pub wave_num: i64,
    pub target_qty: Decimal,
    pub target_price: Decimal,
    pub status: WaveStatus,
    pub filled_qty: Option<Decimal>,
    pub filled_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
    pub pending_order_id: Option<i64>,
}

/// Creation parameters for a session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub symbol: Symbol,
    pub entry_price: Decimal,
    pub distance_pct: Decimal,
    pub max_waves: i64,
    pub isolated_fund: Decimal,
    pub tp_pct: Decimal,
    pub timeout_min: i64,
    pub gap_min: i64,
    pub pip_multiplier: Decimal,
    pub flagged: bool,
}

impl SotStore {
    pub fn insert_session(
        &self,
        new: &NewSession,
        now: DateTime<Utc>,
    ) -> CoreResult<PyramidSession> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pyramid_sessions
             (symbol, entry_price, distance_pct, max_waves, isolated_fund,
              tp_pct, timeout_min, gap_min, pip_multiplier, status, flagged,
              total_filled_qty, total_cost, avg_price, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10,
                     '0', '0', '0', ?11)",
            params![
                new.symbol.as_str(),
                fmt_dec(new.entry_price),
                fmt_dec(new.distance_pct),
                new.max_waves,
                fmt_dec(new.isolated_fund),
                fmt_dec(new.tp_pct),
                new.timeout_min,
                new.gap_min,
                fmt_dec(new.pip_multiplier),
                new.flagged as i64,
                fmt_ts(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT * FROM pyramid_sessions WHERE id = ?1",
            params![id],
            map_session,
        )
        .map_err(Into::into)
    }

    pub fn get_session(&self, id: i64) -> CoreResult<Option<PyramidSession>> {
        self.lock()
            .query_row(
                "SELECT * FROM pyramid_sessions WHERE id = ?1",
                params![id],
                map_session,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_sessions(&self, status: Option<SessionStatus>) -> CoreResult<Vec<PyramidSession>> {
        let conn = self.lock();
        let mut rows = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM pyramid_sessions WHERE status = ?1 ORDER BY id ASC",
                )?;
                for row in stmt.query_map(params![status.as_str()], map_session)? {
                    rows.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM pyramid_sessions ORDER BY id ASC")?;
                for row in stmt.query_map([], map_session)? {
                    rows.push(row?);
                }
            }
        }
        Ok(rows)
    }

    /// CAS a session between statuses. `from` lists the states the move
    /// is legal from; anything else is a stale-state error.
    pub fn transition_session(
        &self,
        id: i64,
        from: &[SessionStatus],
        to: SessionStatus,
        stop_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<PyramidSession> {
        let placeholders = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let started_at_sql = if to == SessionStatus::Active {
            ", started_at = ?3"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE pyramid_sessions SET status = ?1, stop_reason = COALESCE(?2, stop_reason){started_at_sql}
             WHERE id = ?4 AND status IN ({placeholders})"
        );
        let conn = self.lock();
        let changed = conn.execute(
            &sql,
            params![to.as_str(), stop_reason, fmt_ts(now), id],
        )?;
        if changed == 0 {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM pyramid_sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match current {
                Some(status) => CoreError::stale(format!(
                    "session {id} is {status}; cannot move to {}",
                    to.as_str()
                )),
                None => CoreError::validation(format!("session {id} not found")),
            });
        }
        conn.query_row(
            "SELECT * FROM pyramid_sessions WHERE id = ?1",
            params![id],
            map_session,
        )
        .map_err(Into::into)
    }

    /// Reshape parameters on a live session (adjust). Filled waves are
    /// immutable facts; only the session row changes here.
    pub fn update_session_params(
        &self,
        id: i64,
        distance_pct: Decimal,
        max_waves: i64,
        tp_pct: Decimal,
        timeout_min: i64,
        gap_min: i64,
    ) -> CoreResult<PyramidSession> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE pyramid_sessions
             SET distance_pct = ?1, max_waves = ?2, tp_pct = ?3,
                 timeout_min = ?4, gap_min = ?5
             WHERE id = ?6 AND status IN ('PENDING', 'ACTIVE')",
            params![
                fmt_dec(distance_pct),
                max_waves,
                fmt_dec(tp_pct),
                timeout_min,
                gap_min,
                id
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::stale(format!(
                "session {id} is not adjustable (must be PENDING or ACTIVE)"
            )));
        }
        conn.query_row(
            "SELECT * FROM pyramid_sessions WHERE id = ?1",
            params![id],
            map_session,
        )
        .map_err(Into::into)
    }

    /// Fold a wave fill into the session aggregates.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_session_fill(
        &self,
        id: i64,
        total_filled_qty: Decimal,
        total_cost: Decimal,
        avg_price: Decimal,
        current_wave: i64,
        fill_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pyramid_sessions
             SET total_filled_qty = ?1, total_cost = ?2, avg_price = ?3,
                 current_wave = ?4, last_fill_at = ?5
             WHERE id = ?6",
            params![
                fmt_dec(total_filled_qty),
                fmt_dec(total_cost),
                fmt_dec(avg_price),
                current_wave,
                fmt_ts(fill_time),
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_last_wave_queued(&self, id: i64, now: DateTime<Utc>) -> CoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pyramid_sessions SET last_wave_queued_at = ?1 WHERE id = ?2",
            params![fmt_ts(now), id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Waves
    // =========================================================================

    pub fn insert_wave(
        &self,
        session_id: i64,
        wave_num: i64,
        target_qty: Decimal,
        target_price: Decimal,
    ) -> CoreResult<PyramidWave> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pyramid_waves
             (session_id, wave_num, target_qty, target_price, status)
             VALUES (?1, ?2, ?3, ?4, 'PENDING')",
            params![
                session_id,
                wave_num,
                fmt_dec(target_qty),
                fmt_dec(target_price)
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT * FROM pyramid_waves WHERE id = ?1",
            params![id],
            map_wave,
        )
        .map_err(Into::into)
    }

    pub fn get_wave(&self, session_id: i64, wave_num: i64) -> CoreResult<Option<PyramidWave>> {
        self.lock()
            .query_row(
                "SELECT * FROM pyramid_waves WHERE session_id = ?1 AND wave_num = ?2",
                params![session_id, wave_num],
                map_wave,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_waves(&self, session_id: i64) -> CoreResult<Vec<PyramidWave>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM pyramid_waves WHERE session_id = ?1 ORDER BY wave_num ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], map_wave)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Exactly one wave may sit in QUEUED per active session; the
    /// invariant check counts them.
    pub fn count_queued_waves(&self, session_id: i64) -> CoreResult<i64> {
        self.lock()
            .query_row(
                "SELECT COUNT(*) FROM pyramid_waves
                 WHERE session_id = ?1 AND status = 'QUEUED'",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    /// PENDING -> QUEUED, recording the approval-queue row it maps to.
    pub fn mark_wave_queued(
        &self,
        session_id: i64,
        wave_num: i64,
        pending_order_id: i64,
    ) -> CoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE pyramid_waves SET status = 'QUEUED', pending_order_id = ?1
             WHERE session_id = ?2 AND wave_num = ?3 AND status = 'PENDING'",
            params![pending_order_id, session_id, wave_num],
        )?;
        if changed == 0 {
            return Err(CoreError::stale(format!(
                "wave {wave_num} of session {session_id} is not PENDING"
            )));
        }
        Ok(())
    }

    /// Accumulate a (possibly partial) fill into the wave; FILLED once
    /// the target quantity is reached.
    pub fn accumulate_wave_fill(
        &self,
        session_id: i64,
        wave_num: i64,
        filled_qty: Decimal,
        filled_price: Decimal,
        filled: bool,
        fill_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        let conn = self.lock();
        let status = if filled { "FILLED" } else { "QUEUED" };
        conn.execute(
            "UPDATE pyramid_waves
             SET filled_qty = ?1, filled_price = ?2, filled_at = ?3, status = ?4
             WHERE session_id = ?5 AND wave_num = ?6",
            params![
                fmt_dec(filled_qty),
                fmt_dec(filled_price),
                fmt_ts(fill_time),
                status,
                session_id,
                wave_num
            ],
        )?;
        Ok(())
    }

    pub fn cancel_wave(&self, session_id: i64, wave_num: i64) -> CoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pyramid_waves SET status = 'CANCELLED'
             WHERE session_id = ?1 AND wave_num = ?2 AND status IN ('PENDING', 'QUEUED')",
            params![session_id, wave_num],
        )?;
        Ok(())
    }

    /// Drop unfilled wave rows from `from_wave` on; used when an adjust
    /// reshapes the tail of the ladder.
    pub fn delete_unfilled_waves(&self, session_id: i64, from_wave: i64) -> CoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM pyramid_waves
             WHERE session_id = ?1 AND wave_num >= ?2 AND status = 'PENDING'",
            params![session_id, from_wave],
        )?;
        Ok(())
    }

    /// Remove a session and its waves. Refused while the session is
    /// live; stop it first.
    pub fn delete_session(&self, id: i64) -> CoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM pyramid_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(CoreError::validation(format!("session {id} not found")));
        };
        let status: SessionStatus = status
            .parse()
            .map_err(|e: String| CoreError::internal(e))?;
        if matches!(status, SessionStatus::Active | SessionStatus::TpTriggered) {
            return Err(CoreError::stale(format!(
                "session {id} is {}; stop it before deleting",
                status.as_str()
            )));
        }
        tx.execute(
            "DELETE FROM pyramid_waves WHERE session_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM pyramid_sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

fn map_session(row: &Row) -> rusqlite::Result<PyramidSession> {
    Ok(PyramidSession {
        id: row.get("id")?,
        symbol: Symbol::new(row.get::<_, String>("symbol")?),
        entry_price: dec_col(row, "entry_price")?,
        distance_pct: dec_col(row, "distance_pct")?,
        max_waves: row.get("max_waves")?,
        isolated_fund: dec_col(row, "isolated_fund")?,
        tp_pct: dec_col(row, "tp_pct")?,
        timeout_min: row.get("timeout_min")?,
        gap_min: row.get("gap_min")?,
        pip_multiplier: dec_col(row, "pip_multiplier")?,
        status: enum_col(row, "status")?,
        flagged: row.get::<_, i64>("flagged")? != 0,
        stop_reason: row.get("stop_reason")?,
        current_wave: row.get("current_wave")?,
        total_filled_qty: dec_col(row, "total_filled_qty")?,
        total_cost: dec_col(row, "total_cost")?,
        avg_price: dec_col(row, "avg_price")?,
        created_at: ts_col(row, "created_at")?,
        started_at: ts_col_opt(row, "started_at")?,
        last_fill_at: ts_col_opt(row, "last_fill_at")?,
        last_wave_queued_at: ts_col_opt(row, "last_wave_queued_at")?,
    })
}

fn map_wave(row: &Row) -> rusqlite::Result<PyramidWave> {
    Ok(PyramidWave {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        wave_num: row.get("wave_num")?,
        target_qty: dec_col(row, "target_qty")?,
        target_price: dec_col(row, "target_price")?,
        status: enum_col(row, "status")?,
        filled_qty: dec_col_opt(row, "filled_qty")?,
        filled_price: dec_col_opt(row, "filled_price")?,
        filled_at: ts_col_opt(row, "filled_at")?,
        pending_order_id: row.get("pending_order_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_session() -> NewSession {
        NewSession {
            symbol: Symbol::new("BTCUSDT"),
            entry_price: dec!(50000),
            distance_pct: dec!(2),
            max_waves: 3,
            isolated_fund: dec!(10),
            tp_pct: dec!(3),
            timeout_min: 60,
            gap_min: 5,
            pip_multiplier: dec!(2),
            flagged: false,
        }
    }

    #[test]
    fn test_session_cas_transitions() {
        let store = SotStore::open_in_memory().unwrap();
        let now = Utc::now();
        let session = store.insert_session(&new_session(), now).unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        let active = store
            .transition_session(
                session.id,
                &[SessionStatus::Pending],
                SessionStatus::Active,
                None,
                now,
            )
            .unwrap();
        assert_eq!(active.status, SessionStatus::Active);
        assert!(active.started_at.is_some());

        // Starting twice is a stale-state error.
        let err = store
            .transition_session(
                session.id,
                &[SessionStatus::Pending],
                SessionStatus::Active,
                None,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::StaleState(_)));
    }

    #[test]
    fn test_wave_unique_per_session() {
        let store = SotStore::open_in_memory().unwrap();
        let now = Utc::now();
        let session = store.insert_session(&new_session(), now).unwrap();
        store
            .insert_wave(session.id, 0, dec!(0.00002), dec!(50000))
            .unwrap();
        let err = store.insert_wave(session.id, 0, dec!(0.00002), dec!(50000));
        assert!(err.is_err());
    }

    #[test]
    fn test_wave_queue_and_fill_flow() {
        let store = SotStore::open_in_memory().unwrap();
        let now = Utc::now();
        let session = store.insert_session(&new_session(), now).unwrap();
        store
            .insert_wave(session.id, 0, dec!(0.00002), dec!(50000))
            .unwrap();
        store.mark_wave_queued(session.id, 0, 77).unwrap();
        assert_eq!(store.count_queued_waves(session.id).unwrap(), 1);

        store
            .accumulate_wave_fill(session.id, 0, dec!(0.00002), dec!(50000), true, now)
            .unwrap();
        assert_eq!(store.count_queued_waves(session.id).unwrap(), 0);
        let wave = store.get_wave(session.id, 0).unwrap().unwrap();
        assert_eq!(wave.status, WaveStatus::Filled);
        assert_eq!(wave.pending_order_id, Some(77));
    }
}
