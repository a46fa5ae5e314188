//! Pyramid session lifecycle
//!
//! The manager owns session and wave state. Waves reach the market
//! through the approval queue like every other intent; fills come back
//! through the coordinator's hook. Within a session at most one wave is
//! queued at a time, and waves are enqueued in strictly increasing
//! order.

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::events::{BroadcastEvent, FillEvent, PendingResolution};
use crate::exec::engine::ExecutionEngine;
use crate::money::{percent_of, within_step_tolerance};
use crate::pending::PendingQueue;
use crate::price_source::PriceSource;
use crate::pyramid::config::{
    estimated_cost, pip_size, wave_target_price, wave_target_qty, AdjustParams, SessionParams,
};
use crate::store::pyramid::{NewSession, PyramidSession, PyramidWave, SessionStatus, WaveStatus};
use crate::store::sot::{OrderIntent, SotStore};
use crate::types::{OrderSource, OrderType, PendingStatus, Side, Symbol};
use chrono::Duration;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A parsed pyramid `source_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidRef {
    pub session_id: i64,
    pub kind: RefKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Wave(i64),
    TakeProfit,
}

impl PyramidRef {
    /// Parse `pyramid:{session}:wave:{n}` or `pyramid:{session}:tp`.
    pub fn parse(source_ref: &str) -> Option<Self> {
        let mut parts = source_ref.split(':');
        if parts.next()? != "pyramid" {
            return None;
        }
        let session_id = parts.next()?.parse().ok()?;
        match parts.next()? {
            "tp" => Some(PyramidRef {
                session_id,
                kind: RefKind::TakeProfit,
            }),
            "wave" => {
                let wave_num = parts.next()?.parse().ok()?;
                Some(PyramidRef {
                    session_id,
                    kind: RefKind::Wave(wave_num),
                })
            }
            _ => None,
        }
    }

    pub fn wave(session_id: i64, wave_num: i64) -> String {
        format!("pyramid:{session_id}:wave:{wave_num}")
    }

    pub fn take_profit(session_id: i64) -> String {
        format!("pyramid:{session_id}:tp")
    }
}

/// Session plus its ladder, for the summary surface.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: PyramidSession,
    pub waves: Vec<PyramidWave>,
}

pub struct PyramidManager {
    sot: Arc<SotStore>,
    queue: Arc<PendingQueue>,
    engine: Arc<ExecutionEngine>,
    prices: Arc<dyn PriceSource>,
    clock: Arc<dyn Clock>,
    broadcast_tx: broadcast::Sender<BroadcastEvent>,
}

impl PyramidManager {
    pub fn new(
        sot: Arc<SotStore>,
        queue: Arc<PendingQueue>,
        engine: Arc<ExecutionEngine>,
        prices: Arc<dyn PriceSource>,
        clock: Arc<dyn Clock>,
        broadcast_tx: broadcast::Sender<BroadcastEvent>,
    ) -> Self {
        Self {
            sot,
            queue,
            engine,
            prices,
            clock,
            broadcast_tx,
        }
    }

    /// Create a session with its full wave ladder pre-computed. An
    /// estimated cost above the isolated fund flags the session but
    /// does not block it.
    pub async fn create(&self, params: SessionParams) -> CoreResult<PyramidSession> {
        if params.max_waves <= 0 {
            return Err(CoreError::validation("max_waves must be positive"));
        }
        if params.entry_price <= Decimal::ZERO {
            return Err(CoreError::validation("entry_price must be positive"));
        }
        if params.distance_pct < Decimal::ZERO || params.distance_pct >= Decimal::ONE_HUNDRED {
            return Err(CoreError::validation("distance_pct must be in [0, 100)"));
        }

        let symbol = Symbol::new(params.symbol.clone());
        let info = self.prices.exchange_info(&symbol).await?;
        let estimate = estimated_cost(&params, &info);
        let flagged = estimate > params.isolated_fund;
        if flagged {
            warn!(
                "session estimate {estimate} exceeds isolated fund {}; flagging",
                params.isolated_fund
            );
        }

        let session = self.sot.insert_session(
            &NewSession {
                symbol: symbol.clone(),
                entry_price: params.entry_price,
                distance_pct: params.distance_pct,
                max_waves: params.max_waves,
                isolated_fund: params.isolated_fund,
                tp_pct: params.tp_pct,
                timeout_min: params.timeout_min,
                gap_min: params.gap_min,
                pip_multiplier: params.pip_multiplier,
                flagged,
            },
            self.clock.now(),
        )?;

        let pip = pip_size(params.pip_multiplier, &info);
        for n in 0..params.max_waves {
            self.sot.insert_wave(
                session.id,
                n,
                wave_target_qty(n, pip, &info),
                wave_target_price(params.entry_price, params.distance_pct, n, &info),
            )?;
        }
        info!(
            "pyramid session {} created: {} entry={} waves={} est={estimate}",
            session.id, session.symbol, session.entry_price, session.max_waves
        );
        Ok(session)
    }

    /// PENDING -> ACTIVE; wave 0 goes to the approval queue.
    ///
    /// If the enqueue fails the activation rolls back so a retried
    /// start finds the session PENDING again. Queue intake is
    /// idempotent on the wave's source ref, so the retry cannot double
    /// up wave 0.
    pub async fn start(&self, id: i64) -> CoreResult<PyramidSession> {
        let now = self.clock.now();
        let session = self.sot.transition_session(
            id,
            &[SessionStatus::Pending],
            SessionStatus::Active,
            None,
            now,
        )?;
        if let Err(err) = self.enqueue_wave(&session, 0).await {
            warn!("session {id}: queueing wave 0 failed: {err}; rolling activation back");
            if let Err(rollback_err) = self.sot.transition_session(
                id,
                &[SessionStatus::Active],
                SessionStatus::Pending,
                None,
                now,
            ) {
                warn!("session {id}: activation rollback failed: {rollback_err}");
            }
            return Err(err);
        }
        self.broadcast(id, SessionStatus::Active);
        Ok(session)
    }

    /// Stop a session and cancel whatever wave is outstanding.
    pub async fn stop(&self, id: i64, reason: &str) -> CoreResult<PyramidSession> {
        let now = self.clock.now();
        let session = self.sot.transition_session(
            id,
            &[
                SessionStatus::Pending,
                SessionStatus::Active,
                SessionStatus::TpTriggered,
            ],
            SessionStatus::Stopped,
            Some(reason),
            now,
        )?;
        self.cancel_outstanding_wave(id, reason).await?;
        info!("pyramid session {id} stopped: {reason}");
        self.broadcast(id, SessionStatus::Stopped);
        Ok(session)
    }

    /// Reshape a live session. Filled waves are immutable; unfilled
    /// (not yet queued) waves are regenerated from the new parameters.
    pub async fn adjust(&self, id: i64, adjust: AdjustParams) -> CoreResult<PyramidSession> {
        let session = self
            .sot
            .get_session(id)?
            .ok_or_else(|| CoreError::validation(format!("session {id} not found")))?;
        if !matches!(
            session.status,
            SessionStatus::Pending | SessionStatus::Active
        ) {
            return Err(CoreError::stale(format!(
                "session {id} is {}; only PENDING/ACTIVE sessions adjust",
                session.status.as_str()
            )));
        }

        let distance_pct = adjust.distance_pct.unwrap_or(session.distance_pct);
        let max_waves = adjust.max_waves.unwrap_or(session.max_waves);
        let tp_pct = adjust.tp_pct.unwrap_or(session.tp_pct);
        let timeout_min = adjust.timeout_min.unwrap_or(session.timeout_min);
        let gap_min = adjust.gap_min.unwrap_or(session.gap_min);
        if max_waves <= 0 {
            return Err(CoreError::validation("max_waves must be positive"));
        }

        let updated = self.sot.update_session_params(
            id,
            distance_pct,
            max_waves,
            tp_pct,
            timeout_min,
            gap_min,
        )?;

        // Regenerate the unqueued tail of the ladder.
        self.sot.delete_unfilled_waves(id, 0)?;
        let info = self.prices.exchange_info(&session.symbol).await?;
        let pip = pip_size(session.pip_multiplier, &info);
        let existing: Vec<i64> = self
            .sot
            .list_waves(id)?
            .into_iter()
            .map(|w| w.wave_num)
            .collect();
        for n in 0..max_waves {
            if existing.contains(&n) {
                continue;
            }
            self.sot.insert_wave(
                id,
                n,
                wave_target_qty(n, pip, &info),
                wave_target_price(session.entry_price, distance_pct, n, &info),
            )?;
        }
        info!("pyramid session {id} adjusted");
        Ok(updated)
    }

    /// Fire the take-profit exit when the mark clears the threshold:
    /// `current >= avg_price x (1 + tp_pct/100)`.
    pub async fn check_tp(&self, id: i64, current_price: Decimal) -> CoreResult<bool> {
        let now = self.clock.now();
        let session = self
            .sot
            .get_session(id)?
            .ok_or_else(|| CoreError::validation(format!("session {id} not found")))?;
        if session.status != SessionStatus::Active
            || session.total_filled_qty.is_zero()
            || session.avg_price.is_zero()
        {
            return Ok(false);
        }
        let threshold = session.avg_price + percent_of(session.avg_price, session.tp_pct);
        if current_price < threshold {
            return Ok(false);
        }

        self.sot.transition_session(
            id,
            &[SessionStatus::Active],
            SessionStatus::TpTriggered,
            None,
            now,
        )?;
        // Cancel a still-queued wave so the exit is the only live order.
        self.cancel_outstanding_wave(id, "take profit triggered").await?;

        let intent = OrderIntent {
            client_order_id: None,
            symbol: session.symbol.clone(),
            side: Side::Sell,
            order_type: OrderType::Market,
            quantity: Some(session.total_filled_qty),
            pips: None,
            price: current_price,
            stop_price: None,
            source: OrderSource::Pyramid,
            source_ref: Some(PyramidRef::take_profit(id)),
            strategy_name: Some("kss_pyramid".to_string()),
            confidence: None,
        };
        self.queue.queue(intent).await?;
        info!(
            "session {id} take profit triggered at {current_price} (avg {}, threshold {threshold})",
            session.avg_price
        );
        self.broadcast(id, SessionStatus::TpTriggered);
        Ok(true)
    }

    /// Coordinator hook: a fill whose order carries a pyramid ref.
    pub async fn on_fill(&self, event: &FillEvent) -> CoreResult<()> {
        let Some(parsed) = event.source_ref.as_deref().and_then(PyramidRef::parse) else {
            return Ok(());
        };
        match parsed.kind {
            RefKind::Wave(wave_num) => self.on_wave_fill(parsed.session_id, wave_num, event).await,
            RefKind::TakeProfit => self.on_tp_fill(parsed.session_id, event).await,
        }
    }

    async fn on_wave_fill(
        &self,
        session_id: i64,
        wave_num: i64,
        event: &FillEvent,
    ) -> CoreResult<()> {
        let Some(session) = self.sot.get_session(session_id)? else {
            warn!("wave fill for unknown session {session_id}");
            return Ok(());
        };
        if session.status.is_terminal() {
            debug!("ignoring wave fill on terminal session {session_id}");
            return Ok(());
        }
        let Some(wave) = self.sot.get_wave(session_id, wave_num)? else {
            warn!("fill for unknown wave {wave_num} of session {session_id}");
            return Ok(());
        };

        let info = self.prices.exchange_info(&session.symbol).await?;

        // Wave accumulation: partial fills add up until the target is
        // reached within one step of rounding.
        let prev_qty = wave.filled_qty.unwrap_or(Decimal::ZERO);
        let new_qty = prev_qty + event.fill_qty;
        let new_price = if prev_qty.is_zero() {
            event.effective_price
        } else {
            (prev_qty * wave.filled_price.unwrap_or(Decimal::ZERO)
                + event.fill_qty * event.effective_price)
                / new_qty
        };
        let wave_complete = new_qty >= wave.target_qty
            || within_step_tolerance(new_qty, wave.target_qty, info.step_size);
        self.sot.accumulate_wave_fill(
            session_id,
            wave_num,
            new_qty,
            new_price,
            wave_complete,
            event.filled_at,
        )?;

        // Session aggregates.
        let total_filled = session.total_filled_qty + event.fill_qty;
        let total_cost =
            session.total_cost + event.fill_qty * event.effective_price + event.fees;
        let avg_price = if total_filled.is_zero() {
            Decimal::ZERO
        } else {
            total_cost / total_filled
        };
        let current_wave = if wave_complete {
            wave_num + 1
        } else {
            session.current_wave
        };
        self.sot.apply_session_fill(
            session_id,
            total_filled,
            total_cost,
            avg_price,
            current_wave,
            event.filled_at,
        )?;
        info!(
            "session {session_id} wave {wave_num} fill: qty={} avg={avg_price} complete={wave_complete}",
            event.fill_qty
        );

        // Progression: next wave either now or deferred to the timer
        // once the gap has elapsed. The fill itself is a committed
        // fact, so an enqueue failure cannot roll back; the session
        // stops with a marker reason instead of sitting ACTIVE with a
        // wave that never queued.
        if wave_complete && current_wave < session.max_waves {
            if self.gap_elapsed(&session) {
                if let Some(fresh) = self.sot.get_session(session_id)? {
                    if let Err(err) = self.enqueue_wave(&fresh, current_wave).await {
                        self.stop_after_enqueue_failure(session_id, current_wave, &err);
                        return Err(err);
                    }
                }
            } else {
                debug!(
                    "session {session_id}: wave {current_wave} deferred until gap elapses"
                );
            }
        }

        // TP check against the latest mark, when the feed is up.
        match self.prices.current_price(&session.symbol).await {
            Ok(quote) => {
                self.check_tp(session_id, quote.price).await?;
            }
            Err(CoreError::PriceSourceUnavailable(_)) => {}
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn on_tp_fill(&self, session_id: i64, event: &FillEvent) -> CoreResult<()> {
        // The session completes when the exit order is fully filled.
        let Some(order) = self.sot.get_order(event.order_id)? else {
            return Ok(());
        };
        if !order.remaining_qty.is_zero() {
            debug!(
                "session {session_id} take-profit partially filled; {} remaining",
                order.remaining_qty
            );
            return Ok(());
        }
        match self.sot.transition_session(
            session_id,
            &[SessionStatus::TpTriggered],
            SessionStatus::Completed,
            None,
            self.clock.now(),
        ) {
            Ok(_) => {
                info!("pyramid session {session_id} completed");
                self.broadcast(session_id, SessionStatus::Completed);
                Ok(())
            }
            Err(CoreError::StaleState(msg)) => {
                warn!("take-profit fill on session {session_id}: {msg}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Coordinator hook: the approver rejected one of this session's
    /// orders. The session stops; no further waves are enqueued.
    pub async fn on_rejection(&self, resolution: &PendingResolution) -> CoreResult<()> {
        if resolution.approved || resolution.source != OrderSource::Pyramid {
            return Ok(());
        }
        let Some(parsed) = resolution
            .source_ref
            .as_deref()
            .and_then(PyramidRef::parse)
        else {
            return Ok(());
        };
        let reason = format!(
            "rejected_by_user:{}",
            resolution.note.as_deref().unwrap_or("")
        );
        match self.sot.transition_session(
            parsed.session_id,
            &[
                SessionStatus::Pending,
                SessionStatus::Active,
                SessionStatus::TpTriggered,
            ],
            SessionStatus::Stopped,
            Some(&reason),
            self.clock.now(),
        ) {
            Ok(_) => {
                if let RefKind::Wave(wave_num) = parsed.kind {
                    self.sot.cancel_wave(parsed.session_id, wave_num)?;
                }
                info!("pyramid session {} stopped: {reason}", parsed.session_id);
                self.broadcast(parsed.session_id, SessionStatus::Stopped);
            }
            // Already terminal; nothing to do.
            Err(CoreError::StaleState(_)) => {}
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Timer tick: timeouts and deferred wave enqueues across all
    /// active sessions.
    pub async fn timer_tick(&self) -> CoreResult<()> {
        let now = self.clock.now();
        for session in self.sot.list_sessions(Some(SessionStatus::Active))? {
            let queued = self.sot.count_queued_waves(session.id)?;

            // Timeout: no fill activity and nothing queued.
            let anchor = session.last_fill_at.or(session.started_at);
            if queued == 0 {
                if let Some(anchor) = anchor {
                    if now - anchor > Duration::minutes(session.timeout_min) {
                        self.sot.transition_session(
                            session.id,
                            &[SessionStatus::Active],
                            SessionStatus::Timeout,
                            Some("timeout"),
                            now,
                        )?;
                        for wave in self.sot.list_waves(session.id)? {
                            if wave.status == WaveStatus::Pending {
                                self.sot.cancel_wave(session.id, wave.wave_num)?;
                            }
                        }
                        warn!("pyramid session {} timed out", session.id);
                        self.broadcast(session.id, SessionStatus::Timeout);
                        continue;
                    }
                }
            }

            // Deferred enqueue once the gap has elapsed. A failure
            // stops this session with a marker and moves on to the
            // rest.
            if queued == 0
                && session.current_wave > 0
                && session.current_wave < session.max_waves
                && self.gap_elapsed(&session)
            {
                if let Err(err) = self.enqueue_wave(&session, session.current_wave).await {
                    self.stop_after_enqueue_failure(session.id, session.current_wave, &err);
                }
            }
        }
        Ok(())
    }

    /// A wave fill or timer tick could not hand the next wave to the
    /// approval queue. The session must not sit ACTIVE with a wave that
    /// never queued, so it stops with the failure recorded as the stop
    /// reason for the operator.
    fn stop_after_enqueue_failure(&self, session_id: i64, wave_num: i64, err: &CoreError) {
        let reason = format!("wave_enqueue_failed:wave {wave_num}: {err}");
        warn!("session {session_id}: {reason}");
        match self.sot.transition_session(
            session_id,
            &[SessionStatus::Active],
            SessionStatus::Stopped,
            Some(&reason),
            self.clock.now(),
        ) {
            Ok(_) => self.broadcast(session_id, SessionStatus::Stopped),
            Err(stop_err) => warn!(
                "session {session_id}: stop after enqueue failure also failed: {stop_err}"
            ),
        }
    }

    pub fn get(&self, id: i64) -> CoreResult<Option<PyramidSession>> {
        self.sot.get_session(id)
    }

    pub fn delete(&self, id: i64) -> CoreResult<()> {
        self.sot.delete_session(id)
    }

    /// All sessions with their ladders.
    pub fn summary(&self) -> CoreResult<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for session in self.sot.list_sessions(None)? {
            let waves = self.sot.list_waves(session.id)?;
            summaries.push(SessionSummary { session, waves });
        }
        Ok(summaries)
    }

    /// Queue one wave through the approval pipeline. Waves go out in
    /// strictly increasing order, one live wave per session.
    async fn enqueue_wave(&self, session: &PyramidSession, wave_num: i64) -> CoreResult<()> {
        let wave = self
            .sot
            .get_wave(session.id, wave_num)?
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "wave {wave_num} missing for session {}",
                    session.id
                ))
            })?;
        if wave.status != WaveStatus::Pending {
            return Err(CoreError::stale(format!(
                "wave {wave_num} of session {} is {:?}, not PENDING",
                session.id, wave.status
            )));
        }

        let intent = OrderIntent {
            client_order_id: None,
            symbol: session.symbol.clone(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: Some(wave.target_qty),
            pips: None,
            price: wave.target_price,
            stop_price: None,
            source: OrderSource::Pyramid,
            source_ref: Some(PyramidRef::wave(session.id, wave_num)),
            strategy_name: Some("kss_pyramid".to_string()),
            confidence: None,
        };
        let pending = self.queue.queue(intent).await?;
        self.sot.mark_wave_queued(session.id, wave_num, pending.id)?;
        self.sot.set_last_wave_queued(session.id, self.clock.now())?;
        info!(
            "session {} wave {wave_num} queued: qty={} @ {}",
            session.id, wave.target_qty, wave.target_price
        );
        Ok(())
    }

    /// Cancel the queued wave (if any): reject its pending row when it
    /// is still awaiting review, or cancel the live order when it has
    /// already been handed to the engine.
    async fn cancel_outstanding_wave(&self, session_id: i64, reason: &str) -> CoreResult<()> {
        for wave in self.sot.list_waves(session_id)? {
            if wave.status != WaveStatus::Queued {
                continue;
            }
            if let Some(pending_id) = wave.pending_order_id {
                if let Some(pending) = self.sot.get_pending(pending_id)? {
                    match pending.status {
                        PendingStatus::Pending => {
                            // System-side rejection; the session is
                            // already past the state the rejection hook
                            // would act on.
                            if let Err(err) =
                                self.queue.reject(pending_id, "system", reason).await
                            {
                                warn!("rejecting wave order {pending_id}: {err}");
                            }
                        }
                        PendingStatus::Approved | PendingStatus::Executed => {
                            let client_id = pending
                                .client_order_id
                                .clone()
                                .unwrap_or_else(|| format!("pending:{pending_id}"));
                            if let Some(order) =
                                self.sot.get_order_by_client_id(&client_id)?
                            {
                                if !order.status.is_terminal() {
                                    if let Err(err) = self.engine.cancel(order.id, reason) {
                                        warn!("cancelling wave order {}: {err}", order.id);
                                    }
                                }
                            }
                        }
                        PendingStatus::Rejected => {}
                    }
                }
            }
            self.sot.cancel_wave(session_id, wave.wave_num)?;
        }
        Ok(())
    }

    fn gap_elapsed(&self, session: &PyramidSession) -> bool {
        if session.gap_min <= 0 {
            return true;
        }
        match session.last_wave_queued_at {
            Some(last) => self.clock.now() - last >= Duration::minutes(session.gap_min),
            None => true,
        }
    }

    fn broadcast(&self, session_id: i64, status: SessionStatus) {
        let _ = self.broadcast_tx.send(BroadcastEvent::SessionUpdate {
            session_id,
            status: status.as_str().to_string(),
        });
    }
}
