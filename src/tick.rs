// =============================================================================
// Position tick state machine — the scheduler that owns the life-cycle
// =============================================================================
//
// One tick advances the position at most one step. Ordering inside a tick is
// the load-bearing discipline:
//
//   1. operator flags (sleep / emergency shutdown)
//   2. FINALIZATION FIRST — a terminal stop or an externally emptied
//      exchange finalizes the position before any watchdog or trailing
//      logic can issue orders against a corpse
//   3. signal intake (single-position guard, cooldown, lock, dedup)
//   4. entry management (fill poll, Plan B)
//   5. exit placement with the bounded failsafe
//   6. armed management: TP/SL status polls, break-even machine, watchdog
//      planner + plan execution, trailing maintenance, orphan cleanup
//   7. anomaly detectors (read-only)
//   8. atomic persist
//
// Every order replacement follows cancel-first: record the old order's
// executed quantity, cancel, verify a gone status (CANCELED / REJECTED /
// EXPIRED / MISSING — FILLED aborts the transition), place the replacement,
// then re-poll the old order and rebalance if the venue race-filled it.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::binance::client::{is_insufficient_balance_err, BinanceClient};
use crate::binance::rate_limit::RateLimitTracker;
use crate::config::Config;
use crate::dedup::{filter_new, signal_key, DedupParams, PeakSignal};
use crate::emergency;
use crate::entry::{self, PlanB};
use crate::events::EventLog;
use crate::exits;
use crate::invariants::Detectors;
use crate::margin;
use crate::planner::{plan, Detection, PlannedAction, PlannerCfg, PlannerCtx};
use crate::position::{LastClosed, Position};
use crate::reconcile::{self, ReconcileOutcome};
use crate::snapshots::{MidPriceSnapshot, OpenOrdersSnapshot};
use crate::state_store::{BotState, StateStore};
use crate::steps::{ceil_to_step, floor_to_step, round_nearest_step, split_three_legs};
use crate::tail::tail_lines;
use crate::trail::TrailEngine;
use crate::types::{
    EntryMode, OrderKey, OrderStatus, PositionStatus, Side, TrailSource,
};

/// What the main loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// I13 escalated with `I13_KILL_ON_DEBT` — stop the process.
    Halt,
}

/// Verdict of a cancel-verify sequence on the old order.
#[derive(Debug, Clone)]
enum CancelVerdict {
    /// Old order is terminally gone; safe to place the replacement.
    Gone {
        executed_before: Decimal,
        remaining: Decimal,
    },
    /// Old order FILLED under (or before) the cancel — abort the
    /// transition and let finalization handle the fill.
    Filled,
}

/// The engine: owns all mutable trading state and runs the tick.
pub struct Engine {
    pub cfg: Config,
    pub client: BinanceClient,
    pub state: BotState,
    pub store: StateStore,
    pub open_orders: OpenOrdersSnapshot,
    pub mid: MidPriceSnapshot,
    pub trail: TrailEngine,
    pub events: EventLog,
    pub detectors: Detectors,
    pub rate_limits: Arc<RateLimitTracker>,
    last_sync_s: u64,
    dirty: bool,
}

pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        client: BinanceClient,
        state: BotState,
        store: StateStore,
        trail: TrailEngine,
        events: EventLog,
        detectors: Detectors,
        rate_limits: Arc<RateLimitTracker>,
    ) -> Self {
        let open_orders = OpenOrdersSnapshot::new(cfg.snapshot_min_sec);
        Self {
            cfg,
            client,
            state,
            store,
            open_orders,
            mid: MidPriceSnapshot::new(),
            trail,
            events,
            detectors,
            rate_limits,
            last_sync_s: 0,
            dirty: false,
        }
    }

    fn dedup_params(&self) -> DedupParams {
        DedupParams {
            price_decimals: self.cfg.dedup_price_decimals,
            strict_source: self.cfg.strict_source,
            max_keys: self.cfg.seen_keys_max,
        }
    }

    /// Boot-time attach: server time, dedup bootstrap, margin validation,
    /// and the one mandatory reconciliation.
    pub async fn boot(&mut self) -> Result<()> {
        if let Err(e) = self.client.sync_server_time().await {
            warn!(error = %e, "server time sync failed — proceeding with zero offset");
        }

        margin::on_startup(&self.cfg, &self.client).await?;

        let params = self.dedup_params();
        self.state
            .seen_keys
            .bootstrap(&self.cfg.signals_path, self.cfg.tail_lines, &params);

        if let Some(pos) = &self.state.position {
            reconcile::log_boot_state(pos);
        }
        let now = now_s();
        match reconcile::attach(
            &self.cfg,
            &self.client,
            &mut self.state,
            &mut self.open_orders,
            &self.events,
            now,
        )
        .await
        {
            Ok(outcome) => {
                self.last_sync_s = now;
                info!(?outcome, "boot reconciliation complete");
            }
            Err(e) => {
                // The tick will retry; booting blind is still safer than
                // not booting at all.
                warn!(error = %e, "boot reconciliation failed");
            }
        }

        self.dirty = true;
        self.persist();
        Ok(())
    }

    // =========================================================================
    // The tick
    // =========================================================================

    pub async fn tick(&mut self) -> TickOutcome {
        let now = now_s();

        // ── 1. Operator flags ────────────────────────────────────────────
        if self.state.sleeping {
            if emergency::wake_flag_present(&self.cfg) {
                emergency::consume_flags(&self.cfg);
                self.state.sleeping = false;
                self.dirty = true;
                self.events.emit("WAKE_UP", json!({}));
                info!("wake flag detected — resuming normal processing");
            } else {
                return TickOutcome::Continue;
            }
        } else if emergency::emergency_flag_present(&self.cfg) {
            if let Err(e) = emergency::run_shutdown(
                &self.cfg,
                &self.client,
                &mut self.state,
                &mut self.store,
                &self.events,
                now,
            )
            .await
            {
                error!(error = %e, "emergency shutdown pass failed — will retry next tick");
            }
            return TickOutcome::Continue;
        }

        // ── 2. Finalization first ────────────────────────────────────────
        match self.finalization_first(now).await {
            Ok(true) => {
                self.persist();
                return TickOutcome::Continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "finalization-first check failed — continuing");
            }
        }

        // ── 3–6. Entry intake or position management ─────────────────────
        if self.state.position.is_none() {
            if let Err(e) = self.intake_signal(now).await {
                warn!(error = %e, "signal intake failed");
            }
        } else {
            self.manage_position(now).await;
        }

        // ── 7. Detectors (read-only) ─────────────────────────────────────
        let kill = self
            .detectors
            .run(
                &self.cfg,
                &self.state,
                &self.open_orders,
                &self.rate_limits,
                &self.client,
                &self.events,
                now,
            )
            .await;

        // ── 8. Persist ───────────────────────────────────────────────────
        self.persist();

        if kill {
            error!("I13 kill condition met — halting by configuration");
            self.events.emit("I13_KILL", json!({}));
            return TickOutcome::Halt;
        }
        TickOutcome::Continue
    }

    /// Force one persist pass (graceful shutdown path).
    pub fn flush(&mut self) {
        self.dirty = true;
        self.persist();
    }

    fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        if self.store.save(&self.state) {
            self.store.clear_failure();
            self.dirty = false;
        } else if self.store.first_failure() {
            // Fail-aware, not fail-loud: alert once, keep running, let the
            // operator decide on an emergency shutdown.
            self.events.emit(
                "STATE_SAVE_FAILED",
                json!({
                    "hint": "state persistence is failing; consider creating the emergency shutdown flag",
                }),
            );
        }
    }

    // =========================================================================
    // Finalization-first
    // =========================================================================

    /// Detect a terminal stop or an externally emptied exchange before any
    /// other logic runs. Returns `true` when the position was finalized.
    async fn finalization_first(&mut self, now: u64) -> Result<bool> {
        let Some(pos) = &self.state.position else {
            return Ok(false);
        };

        // Crash recovery: sl_done was persisted but the clear did not
        // complete. No cancel, place, or flatten is allowed on this path.
        if pos.sl_done {
            let pos = self.state.position.take().expect("position checked above");
            self.finalize_now(pos, "SL_DONE_RESUME", false, now).await;
            return Ok(true);
        }

        // A fresh FILLED observation on the stop finalizes immediately.
        if pos.fresh_status(OrderKey::Sl, now, self.cfg.sl_recon_fresh_sec)
            == Some(OrderStatus::Filled)
        {
            let mut pos = self.state.position.take().expect("position checked above");
            self.events.emit(
                "SL_FILLED",
                json!({
                    "trade_key": pos.trade_key,
                    "trailing": pos.trail_active,
                    "stop": pos.sl.to_string(),
                }),
            );
            pos.sl_done = true;
            self.state.position = Some(pos);
            self.dirty = true;
            self.persist();
            let pos = self.state.position.take().expect("just stored");
            self.finalize_now(pos, "SL_FILLED", true, now).await;
            return Ok(true);
        }

        // Manual-close suspicion: an armed position whose orders are all
        // invisible on a fresh snapshot. Confirm via the (throttled)
        // reconciler — the only component allowed to clear on exchange-empty.
        if pos.status == PositionStatus::OpenFilled
            && now.saturating_sub(self.last_sync_s) >= self.cfg.sync_exchange_throttle_sec
        {
            self.open_orders
                .refresh(&self.client, &self.cfg.symbol, now, false)
                .await
                .ok();
            let tracked_visible = [pos.entry_id, pos.sl_id, pos.tp1_id, pos.tp2_id]
                .iter()
                .flatten()
                .any(|id| self.open_orders.contains_order(*id));
            if self.open_orders.is_fresh(now, self.cfg.snapshot_min_sec + 2) && !tracked_visible
            {
                self.last_sync_s = now;
                let outcome = reconcile::attach(
                    &self.cfg,
                    &self.client,
                    &mut self.state,
                    &mut self.open_orders,
                    &self.events,
                    now,
                )
                .await
                .context("manual-close reconciliation failed")?;
                self.dirty = true;
                if outcome == ReconcileOutcome::Cleared {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Terminal path: cancel leftovers (when allowed), repay margin, record
    /// the last-closed snapshot, clear the slot, start the cooldown.
    async fn finalize_now(&mut self, pos: Position, reason: &str, order_ops: bool, now: u64) {
        info!(trade_key = %pos.trade_key, reason, order_ops, "finalizing position");

        if order_ops {
            for (key, id) in [
                (OrderKey::Tp1, pos.tp1_id),
                (OrderKey::Tp2, pos.tp2_id),
                (OrderKey::Sl, pos.sl_id),
                (OrderKey::SlPrev, pos.sl_prev_id),
            ] {
                let Some(id) = id else { continue };
                // Housekeeping: leftover cancels are best-effort.
                match self.client.order_status(&self.cfg.symbol, id).await {
                    Ok(info) if info.status.is_live() => {
                        if let Err(e) = self.client.cancel(&self.cfg.symbol, id).await {
                            warn!(order_id = id, key = %key, error = %e, "leftover cancel failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(order_id = id, key = %key, error = %e, "leftover status poll failed")
                    }
                }
            }
        }

        if let Err(e) = margin::after_close(
            &self.cfg,
            &self.client,
            &mut self.state.margin,
            &pos.trade_key,
        )
        .await
        {
            warn!(error = %e, "margin repay on finalize failed — I13 will keep watching");
            self.events.emit(
                "MARGIN_REPAY_FAILED",
                json!({ "trade_key": pos.trade_key, "error": e.to_string() }),
            );
        }

        let last = LastClosed {
            trade_key: pos.trade_key.clone(),
            side: pos.side,
            entry: pos.entry,
            qty_total: pos.qty_total,
            tp1_done: pos.tp1_done,
            tp2_done: pos.tp2_done,
            trail_active: pos.trail_active,
            reason: reason.to_string(),
            closed_at: Utc::now().to_rfc3339(),
            closed_at_s: now,
        };
        self.events.report(
            "TRADE_CLOSED",
            json!({
                "trade_key": last.trade_key,
                "side": last.side.to_string(),
                "entry": last.entry.to_string(),
                "qty_total": last.qty_total.to_string(),
                "tp1_done": last.tp1_done,
                "tp2_done": last.tp2_done,
                "trail_active": last.trail_active,
                "reason": last.reason,
            }),
        );
        self.events.emit(
            "POSITION_CLOSED",
            json!({ "trade_key": last.trade_key, "reason": reason }),
        );

        self.state.last_closed = Some(last);
        self.state.position = None;
        self.state.cooldown_until_s = now + self.cfg.cooldown_sec;
        self.dirty = true;
        self.persist();
    }

    // =========================================================================
    // Signal intake
    // =========================================================================

    async fn intake_signal(&mut self, now: u64) -> Result<()> {
        let lines = match tail_lines(&self.cfg.signals_path, self.cfg.tail_lines) {
            Ok(l) => l,
            Err(e) => {
                debug!(error = %e, "signal log unreadable — nothing to do");
                return Ok(());
            }
        };

        let params = self.dedup_params();
        let fresh: Vec<PeakSignal> = filter_new(
            lines.iter().map(|s| s.as_str()),
            &mut self.state.seen_keys,
            &params,
        );
        if fresh.is_empty() {
            return Ok(());
        }

        // Everything scanned is now seen; only the freshest is acted on.
        for sig in &fresh {
            self.state
                .seen_keys
                .insert(signal_key(sig, &params), params.max_keys);
        }
        self.dirty = true;
        let sig = fresh.last().expect("non-empty checked above").clone();

        let Some(side) = sig.side() else {
            self.events
                .emit("PEAK_IGNORED", json!({ "reason": "unknown kind", "kind": sig.kind }));
            return Ok(());
        };
        if self.cfg.strict_source && sig.source.is_none() {
            self.events
                .emit("PEAK_IGNORED", json!({ "reason": "missing source (strict mode)" }));
            return Ok(());
        }

        // Guards: age, cooldown, duplicate-open lock.
        let age = now.saturating_sub(sig.ts.timestamp().max(0) as u64);
        if age > self.cfg.max_peak_age_sec {
            self.events.emit(
                "PEAK_STALE",
                json!({ "age_sec": age, "limit_sec": self.cfg.max_peak_age_sec }),
            );
            return Ok(());
        }
        if now < self.state.cooldown_until_s {
            self.events.emit(
                "PEAK_IGNORED",
                json!({ "reason": "cooldown", "until_s": self.state.cooldown_until_s }),
            );
            return Ok(());
        }
        if now < self.state.lock_until_s {
            self.events.emit(
                "PEAK_IGNORED",
                json!({ "reason": "entry lock", "until_s": self.state.lock_until_s }),
            );
            return Ok(());
        }

        // Event-triggered reconciliation on signal arrival (throttled).
        if now.saturating_sub(self.last_sync_s) >= self.cfg.sync_exchange_throttle_sec {
            self.last_sync_s = now;
            if let Err(e) = reconcile::attach(
                &self.cfg,
                &self.client,
                &mut self.state,
                &mut self.open_orders,
                &self.events,
                now,
            )
            .await
            {
                warn!(error = %e, "reconcile on signal arrival failed");
            }
            self.dirty = true;
            if self.state.position.is_some() {
                // Reconciliation resurfaced a live position; the guard wins.
                return Ok(());
            }
        }

        self.open_new_position(now, side, &sig).await
    }

    async fn open_new_position(&mut self, now: u64, side: Side, sig: &PeakSignal) -> Result<()> {
        let entry_px = entry::entry_price(&self.cfg, side, sig.price);
        let qty = match entry::entry_qty(&self.cfg, entry_px) {
            Ok(q) => q,
            Err(e) => {
                self.events
                    .emit("ENTRY_REJECTED", json!({ "reason": e.to_string() }));
                return Ok(());
            }
        };
        let split = split_three_legs(qty, self.cfg.qty_step, self.cfg.min_qty);

        let trade_key = entry::new_trade_key();

        // Margin hook with the formatted (step-rounded) values — what the
        // wire will carry.
        if let Err(e) = margin::before_entry(
            &self.cfg,
            &self.client,
            &mut self.state.margin,
            &trade_key,
            side,
            qty,
            entry_px,
        )
        .await
        {
            self.events
                .emit("BORROW_FAILED", json!({ "trade_key": trade_key, "error": e.to_string() }));
            return Err(e);
        }
        self.dirty = true;

        match entry::place_entry(
            &self.cfg,
            &self.client,
            trade_key.clone(),
            side,
            entry_px,
            qty,
            margin::entry_side_effect(&self.cfg),
            now,
        )
        .await
        {
            Ok(mut pos) => {
                pos.apply_split(&split);
                self.events.emit(
                    "ENTRY_PLACED",
                    json!({
                        "trade_key": pos.trade_key,
                        "side": side.to_string(),
                        "entry": entry_px.to_string(),
                        "qty": qty.to_string(),
                        "degraded_split": pos.split_degraded,
                    }),
                );
                self.state.lock_until_s = now + self.cfg.lock_sec;
                self.state.position = Some(pos);
                self.dirty = true;
                Ok(())
            }
            Err(e) => {
                self.events
                    .emit("ENTRY_FAILED", json!({ "trade_key": trade_key, "error": e.to_string() }));
                // Undo the borrow: nothing was opened against it.
                if let Err(re) = margin::after_close(
                    &self.cfg,
                    &self.client,
                    &mut self.state.margin,
                    &trade_key,
                )
                .await
                {
                    warn!(error = %re, "repay after failed entry also failed");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Position management dispatch
    // =========================================================================

    async fn manage_position(&mut self, now: u64) {
        let status = match &self.state.position {
            Some(p) => p.status,
            None => return,
        };
        let res = match status {
            PositionStatus::Pending => self.manage_pending(now).await,
            PositionStatus::Open => self.manage_exit_placement(now).await,
            PositionStatus::OpenFilled => self.manage_armed(now).await,
            PositionStatus::Closing | PositionStatus::Closed => {
                // Should have been finalized; run the terminal path again.
                if let Some(pos) = self.state.position.take() {
                    self.finalize_now(pos, "CLOSING_RESUME", true, now).await;
                }
                Ok(())
            }
        };
        if let Err(e) = res {
            warn!(error = %e, status = %status, "position management step failed");
        }
    }

    // -------------------------------------------------------------------------
    // Pending: waiting for the entry fill
    // -------------------------------------------------------------------------

    async fn manage_pending(&mut self, now: u64) -> Result<()> {
        let Some(pos) = &self.state.position else {
            return Ok(());
        };
        if now < pos.entry_poll_next_s {
            return Ok(());
        }
        let entry_id = pos
            .entry_id
            .context("pending position without an entry order id")?;

        let info = self.client.order_status(&self.cfg.symbol, entry_id).await?;
        let pos = self.state.position.as_mut().expect("checked above");
        pos.entry_poll_next_s = now + self.cfg.poll_sec;
        pos.observe(OrderKey::Entry, info.status, now);
        self.dirty = true;

        match info.status {
            OrderStatus::Filled => {
                pos.status = PositionStatus::Open;
                let trade_key = pos.trade_key.clone();
                self.events
                    .emit("ENTRY_FILLED", json!({ "trade_key": trade_key }));
                margin::after_entry_open(&mut self.state.margin, &trade_key);
                // Exits go out on this same tick.
                return self.manage_exit_placement(now).await;
            }
            st if st.is_gone() => {
                // Entry evaporated without us cancelling it.
                let pos = self.state.position.take().expect("checked above");
                self.events.emit(
                    "ENTRY_VANISHED",
                    json!({ "trade_key": pos.trade_key, "status": st.to_string() }),
                );
                self.finalize_now(pos, "ENTRY_VANISHED", false, now).await;
                return Ok(());
            }
            _ => {}
        }

        // Not filled yet: Plan B once the timeout passes.
        if now >= self.state.position.as_ref().expect("checked").entry_deadline_s {
            return self.entry_plan_b(now, entry_id).await;
        }
        Ok(())
    }

    /// Plan B: the LIMIT entry did not fill in time. Decide between a
    /// MARKET fallback and an abort — then cancel-verify the limit first.
    async fn entry_plan_b(&mut self, now: u64, entry_id: u64) -> Result<()> {
        let (side, entry_px, planned_r, planned_tp1, trade_key) = {
            let pos = self.state.position.as_ref().expect("pending checked");
            (
                pos.side,
                pos.entry,
                pos.planned_r,
                pos.planned_tp1,
                pos.trade_key.clone(),
            )
        };

        let verdict = if self.cfg.entry_mode == EntryMode::LimitOnly {
            PlanB::Abort {
                reason: "entry timeout in LIMIT_ONLY mode".into(),
            }
        } else {
            let mid = self
                .mid
                .refresh(&self.client, &self.cfg.symbol, now)
                .await
                .context("Plan B mid-price read failed")?;
            entry::planb_decide(&self.cfg, side, entry_px, planned_r, planned_tp1, mid)
        };

        info!(trade_key = %trade_key, ?verdict, "entry timeout — applying Plan B");

        // Cancel-verify the resting limit before anything else.
        match self.cancel_verify(entry_id).await? {
            CancelVerdict::Filled => {
                // Race: the entry filled while we were deciding.
                let pos = self.state.position.as_mut().expect("pending checked");
                pos.observe(OrderKey::Entry, OrderStatus::Filled, now);
                pos.status = PositionStatus::Open;
                self.dirty = true;
                self.events
                    .emit("ENTRY_FILLED", json!({ "trade_key": trade_key, "race": true }));
                margin::after_entry_open(&mut self.state.margin, &trade_key);
                return Ok(());
            }
            CancelVerdict::Gone { executed_before, .. } => {
                if executed_before > Decimal::ZERO {
                    // Partial entry: keep what we got and manage it.
                    let pos = self.state.position.as_mut().expect("pending checked");
                    pos.qty_total = executed_before;
                    let split =
                        split_three_legs(pos.qty_total, self.cfg.qty_step, self.cfg.min_qty);
                    pos.apply_split(&split);
                    pos.status = PositionStatus::Open;
                    self.dirty = true;
                    self.events.emit(
                        "ENTRY_PARTIAL_KEPT",
                        json!({ "trade_key": trade_key, "qty": executed_before.to_string() }),
                    );
                    margin::after_entry_open(&mut self.state.margin, &trade_key);
                    return Ok(());
                }
            }
        }

        match verdict {
            PlanB::Abort { reason } => {
                let pos = self.state.position.take().expect("pending checked");
                self.events.emit(
                    "ENTRY_ABORTED_PLANB",
                    json!({ "trade_key": pos.trade_key, "reason": reason }),
                );
                self.finalize_now(pos, "ENTRY_ABORTED_PLANB", false, now).await;
                Ok(())
            }
            PlanB::FallbackMarket => {
                let qty = {
                    let pos = self.state.position.as_ref().expect("pending checked");
                    pos.qty_total
                };
                let key8: String = trade_key.chars().take(8).collect();
                let placed = self
                    .client
                    .place_market(
                        &self.cfg.symbol,
                        side.entry_order_side(),
                        qty,
                        &format!("bb-{key8}-em"),
                        margin::entry_side_effect(&self.cfg),
                    )
                    .await
                    .context("Plan B market entry failed")?;

                let pos = self.state.position.as_mut().expect("pending checked");
                pos.entry_id = Some(placed.order_id);
                pos.status = PositionStatus::Open;
                pos.observe(OrderKey::Entry, OrderStatus::Filled, now);
                self.dirty = true;
                self.events.emit(
                    "ENTRY_MARKET_FALLBACK",
                    json!({ "trade_key": trade_key, "order_id": placed.order_id }),
                );
                margin::after_entry_open(&mut self.state.margin, &trade_key);
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Open: entry filled, exits not yet placed
    // -------------------------------------------------------------------------

    async fn manage_exit_placement(&mut self, now: u64) -> Result<()> {
        {
            let pos = self.state.position.as_ref().expect("open position");
            if pos.halted || now < pos.exits_retry_next_s {
                return Ok(());
            }
        }

        // Compute exit prices once; retries keep the original plan.
        let needs_plan = {
            let pos = self.state.position.as_ref().expect("open position");
            pos.sl == Decimal::ZERO
        };
        if needs_plan {
            let (side, entry_px) = {
                let pos = self.state.position.as_ref().expect("open position");
                (pos.side, pos.entry)
            };
            // Swing stop is best-effort; schema errors are loud but only
            // cost us the swing (percentage fallback still protects).
            let swing = match self.trail.entry_stop(side, self.cfg.swing_mins) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "swing stop unavailable");
                    self.events
                        .emit("TRAIL_FEED_ERROR", json!({ "error": e.to_string() }));
                    None
                }
            };
            let plan = exits::compute_exit_plan(&self.cfg, side, entry_px, swing);
            exits::validate_exit_plan(side, entry_px, &plan, self.cfg.tick_size)?;
            let pos = self.state.position.as_mut().expect("open position");
            pos.sl = plan.sl;
            pos.tp1 = plan.tp1;
            pos.tp2 = plan.tp2;
            self.dirty = true;
        }

        let mut pos = self.state.position.take().expect("open position");
        let result = exits::place_missing_legs(
            &self.cfg,
            &self.client,
            &mut pos,
            margin::exit_side_effect(&self.cfg),
        )
        .await;
        self.dirty = true;

        match result {
            Ok(()) => {
                pos.status = PositionStatus::OpenFilled;
                pos.sl_qty = pos.qty_total;
                pos.exit_place_tries = 0;
                pos.sl_poll_next_s = now + self.cfg.poll_sec;
                self.events.emit(
                    "EXITS_PLACED",
                    json!({
                        "trade_key": pos.trade_key,
                        "sl": pos.sl.to_string(),
                        "tp1": pos.tp1.to_string(),
                        "tp2": pos.tp2.to_string(),
                    }),
                );
                self.state.position = Some(pos);
                Ok(())
            }
            Err(e) => {
                pos.exit_place_tries += 1;
                pos.exits_retry_next_s = now + self.cfg.exits_retry_every_sec;
                let tries = pos.exit_place_tries;
                self.events.emit(
                    "EXITS_RETRY",
                    json!({
                        "trade_key": pos.trade_key,
                        "tries": tries,
                        "max": self.cfg.failsafe_exits_max_tries,
                        "error": e.to_string(),
                    }),
                );

                if tries >= self.cfg.failsafe_exits_max_tries {
                    if self.cfg.failsafe_flatten {
                        warn!("exit placement budget exhausted — failsafe flatten");
                        match exits::market_flatten(
                            &self.cfg,
                            &self.client,
                            &pos,
                            margin::exit_side_effect(&self.cfg),
                            "FAILSAFE_EXITS",
                        )
                        .await
                        {
                            Ok(order_id) => {
                                self.events.emit(
                                    "FAILSAFE_FLATTENED",
                                    json!({ "trade_key": pos.trade_key, "order_id": order_id }),
                                );
                                self.finalize_now(pos, "FAILSAFE_FLATTENED", true, now).await;
                                return Ok(());
                            }
                            Err(fe) => {
                                error!(error = %fe, "failsafe flatten failed — halting position");
                                pos.halted = true;
                                self.events.emit(
                                    "EXITS_HALTED",
                                    json!({ "trade_key": pos.trade_key, "error": fe.to_string() }),
                                );
                            }
                        }
                    } else {
                        pos.halted = true;
                        self.events.emit(
                            "EXITS_HALTED",
                            json!({ "trade_key": pos.trade_key, "error": e.to_string() }),
                        );
                    }
                }
                self.state.position = Some(pos);
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // OpenFilled: polls, break-even machine, watchdogs, trailing, cleanup
    // -------------------------------------------------------------------------

    async fn manage_armed(&mut self, now: u64) -> Result<()> {
        // Status polls first: they feed every later decision.
        self.poll_leg_statuses(now).await?;

        // A poll may have discovered the terminal stop.
        if self
            .state
            .position
            .as_ref()
            .map(|p| p.sl_done || p.fresh_status(OrderKey::Sl, now, self.cfg.sl_recon_fresh_sec) == Some(OrderStatus::Filled))
            .unwrap_or(false)
        {
            if self.finalization_first(now).await? {
                return Ok(());
            }
        }
        if self.state.position.is_none() {
            return Ok(());
        }

        // Break-even machine runs before the planner: a fresh stop changes
        // what the watchdogs see.
        self.run_break_even(now).await?;
        if self.state.position.is_none() {
            return Ok(());
        }

        // Watchdog planning over refreshed snapshots.
        self.open_orders
            .refresh(&self.client, &self.cfg.symbol, now, false)
            .await
            .ok();
        self.mid.refresh(&self.client, &self.cfg.symbol, now).await.ok();

        let planner_cfg = PlannerCfg {
            sl_watchdog_grace_sec: self.cfg.sl_watchdog_grace_sec,
            recon_fresh_sec: self.cfg.sl_recon_fresh_sec,
            tick_size: self.cfg.tick_size,
        };
        let wd_plan = {
            let pos = self.state.position.as_ref().expect("armed position");
            let ctx = PlannerCtx {
                pos,
                orders: self.open_orders.orders(),
                orders_fresh: self
                    .open_orders
                    .is_fresh(now, self.cfg.snapshot_min_sec + 2),
                mid: self.mid.mid(),
                now_s: now,
            };
            plan(&ctx, &planner_cfg)
        };

        if !wd_plan.is_empty() {
            debug!(
                detections = wd_plan.detections.len(),
                actions = wd_plan.actions.len(),
                "watchdog plan computed"
            );
        }
        self.apply_detections(&wd_plan.detections, now);
        self.execute_actions(wd_plan.actions, now).await?;
        if self.state.position.is_none() {
            return Ok(());
        }

        self.run_trailing(now).await?;
        if self.state.position.is_none() {
            return Ok(());
        }

        self.cleanup_orphans(now).await;
        Ok(())
    }

    /// Throttled status polls for TP1, TP2, and the stop.
    async fn poll_leg_statuses(&mut self, now: u64) -> Result<()> {
        // TP1
        let tp1_due = {
            let pos = self.state.position.as_ref().expect("armed position");
            (!pos.tp1_done && pos.tp1_id.is_some() && now >= pos.tp1_poll_next_s)
                .then_some(pos.tp1_id.unwrap_or_default())
        };
        if let Some(tp1_id) = tp1_due {
            let info = self.client.order_status(&self.cfg.symbol, tp1_id).await?;
            let pos = self.state.position.as_mut().expect("armed position");
            pos.tp1_poll_next_s = now + self.cfg.poll_sec;
            pos.observe(OrderKey::Tp1, info.status, now);
            self.dirty = true;
            if info.status == OrderStatus::Filled {
                self.on_tp1_filled(now, "fill");
            }
        }

        // TP2
        let tp2_due = {
            let pos = self.state.position.as_ref().expect("armed position");
            (pos.tp1_done && !pos.tp2_done && pos.tp2_id.is_some() && now >= pos.tp2_poll_next_s)
                .then_some(pos.tp2_id.unwrap_or_default())
        };
        if let Some(tp2_id) = tp2_due {
            let info = self.client.order_status(&self.cfg.symbol, tp2_id).await?;
            let pos = self.state.position.as_mut().expect("armed position");
            pos.tp2_poll_next_s = now + self.cfg.poll_sec;
            pos.observe(OrderKey::Tp2, info.status, now);
            self.dirty = true;
            if info.status == OrderStatus::Filled {
                self.on_tp2_filled(now, false).await;
            }
        }

        // SL
        let sl_due = {
            let pos = self.state.position.as_ref().expect("armed position");
            (pos.sl_id.is_some() && now >= pos.sl_poll_next_s)
                .then_some(pos.sl_id.unwrap_or_default())
        };
        if let Some(sl_id) = sl_due {
            let info = self.client.order_status(&self.cfg.symbol, sl_id).await?;
            let pos = self.state.position.as_mut().expect("armed position");
            pos.sl_poll_next_s = now + self.cfg.poll_sec;
            pos.observe(OrderKey::Sl, info.status, now);
            self.dirty = true;
        }
        Ok(())
    }

    /// TP1 FILLED is a fact: record it unconditionally and arm the
    /// break-even transition (a separate, retryable machine).
    fn on_tp1_filled(&mut self, _now: u64, via: &str) {
        let pos = self.state.position.as_mut().expect("armed position");
        if pos.tp1_done {
            return;
        }
        pos.tp1_done = true;
        pos.tp1_be_pending = true;
        pos.tp1_be_old_sl = pos.sl_id;
        pos.tp1_be_attempts = 0;
        pos.tp1_be_next_s = 0;
        self.dirty = true;
        let trade_key = pos.trade_key.clone();
        self.events
            .emit("TP1_DONE", json!({ "trade_key": trade_key, "via": via }));
    }

    /// TP2 FILLED: activate trailing on qty3 (synthetic path activates on
    /// qty2 + qty3 instead and is handled by the planner action).
    async fn on_tp2_filled(&mut self, now: u64, synthetic: bool) {
        let (trade_key, degraded, remaining) = {
            let pos = self.state.position.as_mut().expect("armed position");
            if pos.tp2_done {
                return;
            }
            pos.tp2_done = true;
            pos.tp2_synthetic = synthetic;
            self.dirty = true;
            (pos.trade_key.clone(), pos.split_degraded, pos.remaining_qty())
        };
        self.events
            .emit("TP2_DONE", json!({ "trade_key": trade_key, "synthetic": synthetic }));

        if remaining <= Decimal::ZERO {
            // Degraded split: nothing left to trail; the stop is an orphan.
            let pos = self.state.position.take().expect("armed position");
            self.finalize_now(pos, "TP2_DONE_FINAL", true, now).await;
            return;
        }
        let pos = self.state.position.as_mut().expect("armed position");
        if degraded {
            // Non-zero remainder on a degraded split cannot happen by
            // construction, but never trail it.
            warn!("degraded split with remainder after TP2 — leaving stop in place");
            return;
        }
        pos.trail_active = true;
        pos.trail_confirmed = self.cfg.trail_confirm_buffer_usd == Decimal::ZERO;
        pos.trail_next_s = 0;
        pos.last_trail_update_s = now;
        let qty = pos.remaining_qty();
        self.events.emit(
            "TRAIL_ACTIVATED",
            json!({ "trade_key": trade_key, "qty": qty.to_string(), "synthetic": synthetic }),
        );
    }

    // -------------------------------------------------------------------------
    // Break-even machine
    // -------------------------------------------------------------------------

    async fn run_break_even(&mut self, now: u64) -> Result<()> {
        let due = {
            let pos = self.state.position.as_mut().expect("armed position");
            if !pos.tp1_be_pending {
                return Ok(());
            }
            if now < pos.tp1_be_next_s {
                return Ok(());
            }
            if pos.tp1_be_attempts >= self.cfg.tp1_be_max_attempts {
                // Cooldown elapsed (next_s passed) — re-arm.
                pos.tp1_be_attempts = 0;
            }
            true
        };
        if !due {
            return Ok(());
        }

        let (old_sl, side, entry_px, qty) = {
            let pos = self.state.position.as_ref().expect("armed position");
            let old = pos.tp1_be_old_sl.or(pos.sl_id);
            (old, pos.side, pos.entry, pos.qty2 + pos.qty3)
        };
        let be_price = round_nearest_step(entry_px, self.cfg.tick_size);

        let result = self
            .replace_stop(now, old_sl, be_price, qty, "BREAK_EVEN")
            .await;

        match result {
            Ok(true) => {
                let pos = self.state.position.as_mut().expect("armed position");
                pos.tp1_be_pending = false;
                pos.tp1_be_attempts = 0;
                pos.tp1_be_old_sl = None;
                // Immediate status check of the fresh stop, no throttle.
                pos.sl_poll_next_s = 0;
                self.dirty = true;
                let trade_key = pos.trade_key.clone();
                self.events.emit(
                    "BE_PLACED",
                    json!({ "trade_key": trade_key, "stop": be_price.to_string() }),
                );
                Ok(())
            }
            Ok(false) => {
                // Old stop filled during the transition; finalization ran.
                Ok(())
            }
            Err(e) => {
                let pos = self.state.position.as_mut().expect("armed position");
                pos.tp1_be_attempts += 1;
                pos.tp1_be_next_s = if pos.tp1_be_attempts >= self.cfg.tp1_be_max_attempts {
                    now + self.cfg.tp1_be_cooldown_sec
                } else {
                    now + self.cfg.sl_watchdog_retry_sec
                };
                self.dirty = true;
                let trade_key = pos.trade_key.clone();
                let attempts = pos.tp1_be_attempts;
                let insufficient = is_insufficient_balance_err(&e);
                self.events.emit(
                    "BE_RETRY",
                    json!({
                        "trade_key": trade_key,
                        "attempts": attempts,
                        "max": self.cfg.tp1_be_max_attempts,
                        "insufficient_balance": insufficient,
                        "error": e.to_string(),
                    }),
                );
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Watchdog plan execution
    // -------------------------------------------------------------------------

    fn apply_detections(&mut self, detections: &[Detection], now: u64) {
        for det in detections {
            let pos = self.state.position.as_mut().expect("armed position");
            let trade_key = pos.trade_key.clone();
            match det {
                Detection::SlCrossedStart => {
                    pos.sl_cross_since_s = now;
                    self.dirty = true;
                    debug!("mid crossed the stop — grace clock started");
                }
                Detection::SlCrossedClear => {
                    pos.sl_cross_since_s = 0;
                    pos.sl_wd_slip_logged = false;
                    self.dirty = true;
                }
                Detection::SlPartialFill { executed, remaining } => {
                    pos.sl_wd_partial_logged = true;
                    self.dirty = true;
                    self.events.emit(
                        "SL_WD_PARTIAL",
                        json!({
                            "trade_key": trade_key,
                            "executed": executed.to_string(),
                            "remaining": remaining.to_string(),
                        }),
                    );
                }
                Detection::SlSlippage { mid, stop } => {
                    pos.sl_wd_slip_logged = true;
                    self.dirty = true;
                    self.events.emit(
                        "SL_WD_SLIPPAGE",
                        json!({
                            "trade_key": trade_key,
                            "mid": mid.to_string(),
                            "stop": stop.to_string(),
                        }),
                    );
                }
                Detection::Tp1MissingCrossed { status } => {
                    pos.tp1_wd_missing_logged = true;
                    self.dirty = true;
                    self.events.emit(
                        "TP1_WD_MISSING",
                        json!({ "trade_key": trade_key, "status": status.to_string() }),
                    );
                }
                Detection::Tp2MissingCrossed { status } => {
                    pos.tp2_wd_missing_logged = true;
                    self.dirty = true;
                    self.events.emit(
                        "TP2_WD_MISSING",
                        json!({ "trade_key": trade_key, "status": status.to_string() }),
                    );
                }
                Detection::StopFilled => {
                    // Handled by finalization; nothing to mark.
                }
            }
        }
    }

    async fn execute_actions(&mut self, actions: Vec<PlannedAction>, now: u64) -> Result<()> {
        let mut idx = 0usize;
        while idx < actions.len() {
            if self.state.position.is_none() {
                return Ok(());
            }
            match &actions[idx] {
                PlannedAction::Finalize { reason } => {
                    let reason = reason.clone();
                    let mut pos = self.state.position.take().expect("checked");
                    if reason == "SL_FILLED" {
                        self.events.emit(
                            "SL_FILLED",
                            json!({
                                "trade_key": pos.trade_key,
                                "trailing": pos.trail_active,
                            }),
                        );
                        pos.sl_done = true;
                        self.state.position = Some(pos);
                        self.dirty = true;
                        self.persist();
                        let pos = self.state.position.take().expect("just stored");
                        self.finalize_now(pos, &reason, true, now).await;
                    } else {
                        self.finalize_now(pos, &reason, true, now).await;
                    }
                    return Ok(());
                }

                PlannedAction::CancelOrder { key, order_id, reason }
                    if matches!(
                        actions.get(idx + 1),
                        Some(PlannedAction::PlaceStopMarketFallback { .. })
                    ) =>
                {
                    // cancel → verify → market-flatten → post-verify.
                    let (key, order_id, reason) = (*key, *order_id, reason.clone());
                    self.stop_market_fallback(now, key, order_id, &reason).await?;
                    idx += 2;
                    continue;
                }

                PlannedAction::CancelOrder { order_id, reason, .. } => {
                    // Standalone cancel (housekeeping).
                    debug!(order_id, reason = %reason, "standalone watchdog cancel");
                    if let Err(e) = self.client.cancel(&self.cfg.symbol, *order_id).await {
                        warn!(order_id, error = %e, "watchdog cancel failed");
                    }
                }

                PlannedAction::PlaceStopMarketFallback { qty } => {
                    // Unpaired fallback (stop already gone — including a
                    // crash between cancel and flatten on a previous run).
                    let qty = *qty;
                    let may = {
                        let pos = self.state.position.as_mut().expect("checked");
                        pos.sl_wd.may_attempt(now, self.cfg.watchdog_max_attempts)
                    };
                    if may {
                        if let Err(e) =
                            self.market_close_and_finalize(now, qty, "SL_FALLBACK").await
                        {
                            self.record_sl_wd_failure(now, &e);
                        }
                    }
                    return Ok(());
                }

                PlannedAction::MarketCloseLeg { key, qty } => {
                    let (key, qty) = (*key, *qty);
                    self.market_close_leg(now, key, qty).await?;
                }

                PlannedAction::ActivateSyntheticTrailing { qty } => {
                    let qty = *qty;
                    info!(qty = %qty, "activating synthetic trailing (TP2 never filled)");
                    self.on_tp2_filled(now, true).await;
                }
            }
            idx += 1;
        }
        Ok(())
    }

    /// The SL fallback: cancel-verify the stop, market-flatten the
    /// remainder, post-verify, rebalance on race-fill, then finalize.
    async fn stop_market_fallback(
        &mut self,
        now: u64,
        _key: OrderKey,
        old_id: u64,
        reason: &str,
    ) -> Result<()> {
        let may = {
            let pos = self.state.position.as_mut().expect("armed position");
            pos.sl_wd
                .may_attempt(now, self.cfg.watchdog_max_attempts)
        };
        if !may {
            return Ok(());
        }

        let verdict = match self.cancel_verify(old_id).await {
            Ok(v) => v,
            Err(e) => {
                self.record_sl_wd_failure(now, &e);
                return Ok(());
            }
        };

        match verdict {
            CancelVerdict::Filled => {
                // The stop succeeded while being cancelled: a fill, not a
                // failure. Finalize right away.
                let pos = self.state.position.as_mut().expect("armed position");
                pos.observe(OrderKey::Sl, OrderStatus::Filled, now);
                self.dirty = true;
                self.finalization_first(now).await?;
                Ok(())
            }
            CancelVerdict::Gone {
                executed_before,
                remaining,
            } => {
                {
                    let pos = self.state.position.as_mut().expect("armed position");
                    pos.sl_wd.executed_before_cancel = executed_before;
                    pos.sl_prev_id = Some(old_id);
                    pos.sl_id = None;
                    self.dirty = true;
                }
                let fallback = self
                    .market_fallback_with_verify(now, old_id, executed_before, remaining, reason)
                    .await;
                match fallback {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.record_sl_wd_failure(now, &e);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn market_fallback_with_verify(
        &mut self,
        now: u64,
        old_id: u64,
        executed_before: Decimal,
        remaining: Decimal,
        reason: &str,
    ) -> Result<()> {
        let (side, trade_key) = {
            let pos = self.state.position.as_ref().expect("armed position");
            (pos.side, pos.trade_key.clone())
        };
        let key8: String = trade_key.chars().take(8).collect();

        let placed = self
            .client
            .place_market(
                &self.cfg.symbol,
                side.exit_order_side(),
                remaining,
                &format!("bb-{key8}-wdf"),
                margin::exit_side_effect(&self.cfg),
            )
            .await
            .context("stop market fallback failed")?;
        self.events.emit(
            "SL_FALLBACK_MARKET",
            json!({
                "trade_key": trade_key,
                "order_id": placed.order_id,
                "qty": remaining.to_string(),
                "reason": reason,
            }),
        );

        // Post-market verify: did the venue race-fill the old stop between
        // cancel-send and cancel-confirm?
        self.rebalance_if_race_filled(now, old_id, executed_before).await;

        let pos = self.state.position.take().expect("armed position");
        self.finalize_now(pos, "SL_FALLBACK", true, now).await;
        Ok(())
    }

    /// Re-poll the old order after a replacement executed. A FILLED status
    /// with more execution than we recorded before the cancel means the
    /// replacement double-closed; offset the difference immediately.
    async fn rebalance_if_race_filled(&mut self, _now: u64, old_id: u64, executed_before: Decimal) {
        let info = match self.client.order_status(&self.cfg.symbol, old_id).await {
            Ok(i) => i,
            Err(e) => {
                warn!(order_id = old_id, error = %e, "post-market verify poll failed");
                return;
            }
        };
        if info.status != OrderStatus::Filled || info.executed_qty <= executed_before {
            return;
        }
        let extra = info.executed_qty - executed_before;
        let (side, trade_key) = {
            let pos_side = self
                .state
                .position
                .as_ref()
                .map(|p| (p.side, p.trade_key.clone()));
            match pos_side {
                Some(v) => v,
                // Position already finalized: rebalance against last-closed.
                None => match &self.state.last_closed {
                    Some(l) => (l.side, l.trade_key.clone()),
                    None => return,
                },
            }
        };

        warn!(
            order_id = old_id,
            extra = %extra,
            "race-fill detected after replacement — rebalancing"
        );
        let key8: String = trade_key.chars().take(8).collect();
        match self
            .client
            .place_market(
                &self.cfg.symbol,
                side.entry_order_side(),
                extra,
                &format!("bb-{key8}-rb"),
                margin::exit_side_effect(&self.cfg),
            )
            .await
        {
            Ok(placed) => {
                self.events.emit(
                    "DOUBLE_FILL_REBALANCE",
                    json!({
                        "trade_key": trade_key,
                        "qty": extra.to_string(),
                        "order_id": placed.order_id,
                    }),
                );
            }
            Err(e) => {
                error!(error = %e, "rebalance order failed — exposure left open");
                self.events.emit(
                    "REBALANCE_FAILED",
                    json!({ "trade_key": trade_key, "qty": extra.to_string(), "error": e.to_string() }),
                );
            }
        }
    }

    fn record_sl_wd_failure(&mut self, now: u64, e: &anyhow::Error) {
        let pos = self.state.position.as_mut().expect("armed position");
        pos.sl_wd.record_failure(
            &e.to_string(),
            now,
            self.cfg.sl_watchdog_retry_sec,
            self.cfg.watchdog_max_attempts,
            self.cfg.watchdog_cooldown_sec,
        );
        self.dirty = true;
        let trade_key = pos.trade_key.clone();
        let attempts = pos.sl_wd.attempts;
        self.events.emit(
            "SL_WD_RETRY",
            json!({
                "trade_key": trade_key,
                "attempts": attempts,
                "max": self.cfg.watchdog_max_attempts,
                "error": e.to_string(),
            }),
        );
    }

    /// Market-close one TP leg whose order evaporated while price crossed
    /// its target. TP1 initializes the break-even transition afterwards;
    /// TP2 (degraded path) closes the remainder and finalizes.
    async fn market_close_leg(&mut self, now: u64, key: OrderKey, qty: Decimal) -> Result<()> {
        let (side, trade_key) = {
            let pos = self.state.position.as_ref().expect("armed position");
            (pos.side, pos.trade_key.clone())
        };
        let key8: String = trade_key.chars().take(8).collect();
        let tag = if key == OrderKey::Tp1 { "tp1wd" } else { "tp2wd" };

        let placed = self
            .client
            .place_market(
                &self.cfg.symbol,
                side.exit_order_side(),
                qty,
                &format!("bb-{key8}-{tag}"),
                margin::exit_side_effect(&self.cfg),
            )
            .await
            .with_context(|| format!("market close of {key} leg failed"))?;
        self.events.emit(
            "LEG_MARKET_CLOSED",
            json!({
                "trade_key": trade_key,
                "leg": key.to_string(),
                "qty": qty.to_string(),
                "order_id": placed.order_id,
            }),
        );
        self.dirty = true;

        match key {
            OrderKey::Tp1 => {
                self.on_tp1_filled(now, "watchdog market close");
                let pos = self.state.position.as_mut().expect("armed position");
                pos.tp1_id = None;
                pos.recon.remove(&OrderKey::Tp1);
            }
            OrderKey::Tp2 => {
                // Entire remainder closed: terminal.
                let pos = self.state.position.as_mut().expect("armed position");
                pos.tp2_done = true;
                pos.tp2_id = None;
                let pos = self.state.position.take().expect("armed position");
                self.finalize_now(pos, "TP2_WD_MARKET_CLOSE", true, now).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Flatten `qty` at market and finalize (fallback path where no cancel
    /// was needed because the stop was already gone).
    async fn market_close_and_finalize(&mut self, now: u64, qty: Decimal, reason: &str) -> Result<()> {
        let (side, trade_key) = {
            let pos = self.state.position.as_ref().expect("armed position");
            (pos.side, pos.trade_key.clone())
        };
        let key8: String = trade_key.chars().take(8).collect();
        self.client
            .place_market(
                &self.cfg.symbol,
                side.exit_order_side(),
                qty,
                &format!("bb-{key8}-wdf"),
                margin::exit_side_effect(&self.cfg),
            )
            .await
            .context("market fallback failed")?;
        let pos = self.state.position.take().expect("armed position");
        self.finalize_now(pos, reason, true, now).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cancel-verify-replace plumbing
    // -------------------------------------------------------------------------

    /// The cancel-first contract (§ordering): record executed quantity,
    /// cancel, verify the order is gone. FILLED at any point aborts the
    /// transition — the old order won.
    async fn cancel_verify(&mut self, order_id: u64) -> Result<CancelVerdict> {
        // 1. Record execution before the cancel.
        let before = self.client.order_status(&self.cfg.symbol, order_id).await?;
        if before.status == OrderStatus::Filled {
            return Ok(CancelVerdict::Filled);
        }
        let executed_before = before.executed_qty;
        if before.status.is_gone() {
            return Ok(CancelVerdict::Gone {
                executed_before,
                remaining: (before.orig_qty - executed_before).max(Decimal::ZERO),
            });
        }

        // 2. Cancel (an unknown-order response means it is already gone).
        self.client.cancel(&self.cfg.symbol, order_id).await?;

        // 3. Verify via status poll.
        let after = self.client.order_status(&self.cfg.symbol, order_id).await?;
        match after.status {
            OrderStatus::Filled => Ok(CancelVerdict::Filled),
            st if st.is_gone() => Ok(CancelVerdict::Gone {
                executed_before,
                remaining: (after.orig_qty - after.executed_qty).max(Decimal::ZERO),
            }),
            st => bail!("cancel of order {order_id} not confirmed: status {st}"),
        }
    }

    /// Cancel-verify-replace for the stop order (break-even, trailing
    /// moves, resizes). Returns `Ok(false)` when the old stop filled and
    /// the position was finalized instead.
    async fn replace_stop(
        &mut self,
        now: u64,
        old_id: Option<u64>,
        new_stop: Decimal,
        qty: Decimal,
        label: &str,
    ) -> Result<bool> {
        let mut executed_before = Decimal::ZERO;
        if let Some(old_id) = old_id {
            match self.cancel_verify(old_id).await? {
                CancelVerdict::Filled => {
                    let pos = self.state.position.as_mut().expect("armed position");
                    pos.observe(OrderKey::Sl, OrderStatus::Filled, now);
                    self.dirty = true;
                    if self.finalization_first(now).await? {
                        return Ok(false);
                    }
                    return Ok(false);
                }
                CancelVerdict::Gone { executed_before: eb, .. } => {
                    executed_before = eb;
                    let pos = self.state.position.as_mut().expect("armed position");
                    pos.sl_prev_id = Some(old_id);
                    pos.sl_id = None;
                    self.dirty = true;
                }
            }
        }

        let (side, trade_key) = {
            let pos = self.state.position.as_ref().expect("armed position");
            (pos.side, pos.trade_key.clone())
        };
        let key8: String = trade_key.chars().take(8).collect();
        let offset = self.cfg.tick_size * Decimal::from(5);
        let limit = match side {
            Side::Long => new_stop - offset,
            Side::Short => new_stop + offset,
        };

        let placed = self
            .client
            .place_stop_loss_limit(
                &self.cfg.symbol,
                side.exit_order_side(),
                qty,
                new_stop,
                limit,
                &format!("bb-{key8}-rs"),
                margin::exit_side_effect(&self.cfg),
            )
            .await
            .with_context(|| format!("{label} stop replacement failed"))?;

        {
            let pos = self.state.position.as_mut().expect("armed position");
            pos.sl_id = Some(placed.order_id);
            pos.sl = new_stop;
            pos.sl_qty = qty;
            pos.recon.remove(&OrderKey::Sl);
            self.dirty = true;
        }

        // Post-replace verify of the old order: a race-filled stop means
        // the position is actually closed and the fresh stop is an orphan.
        if let Some(old_id) = old_id {
            let info = self.client.order_status(&self.cfg.symbol, old_id).await;
            if let Ok(info) = info {
                if info.status == OrderStatus::Filled && info.executed_qty > executed_before {
                    warn!(
                        old_id,
                        "old stop race-filled during {label} replacement — unwinding"
                    );
                    if let Err(e) = self.client.cancel(&self.cfg.symbol, placed.order_id).await {
                        warn!(error = %e, "cancel of orphan replacement stop failed");
                    }
                    self.events.emit(
                        "SL_FILLED",
                        json!({ "trade_key": trade_key, "race": true }),
                    );
                    let mut pos = self.state.position.take().expect("armed position");
                    pos.sl_done = true;
                    self.state.position = Some(pos);
                    self.dirty = true;
                    self.persist();
                    let pos = self.state.position.take().expect("just stored");
                    self.finalize_now(pos, "SL_FILLED_RACE", true, now).await;
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Trailing maintenance
    // -------------------------------------------------------------------------

    async fn run_trailing(&mut self, now: u64) -> Result<()> {
        let due = {
            let pos = self.state.position.as_ref().expect("armed position");
            pos.trail_active && now >= pos.trail_next_s
        };
        if !due {
            return Ok(());
        }
        {
            let pos = self.state.position.as_mut().expect("armed position");
            pos.trail_next_s = now + self.cfg.trail_update_every_sec;
            self.dirty = true;
        }

        let (side, current_sl, confirmed, tp2, remaining, sl_qty, old_id) = {
            let pos = self.state.position.as_ref().expect("armed position");
            (
                pos.side,
                pos.sl,
                pos.trail_confirmed,
                pos.tp2,
                pos.remaining_qty(),
                pos.sl_qty,
                pos.sl_id,
            )
        };

        // Activation confirmation: wait for a bar close beyond the
        // reference before the first move.
        if !confirmed {
            let reference = tp2;
            let ok = match self.cfg.trail_source {
                TrailSource::Agg => self.trail.close_confirms(side, reference).unwrap_or(false),
                TrailSource::Book => match self.mid.mid() {
                    Some(mid) if self.mid.is_fresh(now, self.cfg.snapshot_min_sec * 2) => {
                        crate::trail::close_confirms(
                            mid,
                            reference,
                            side,
                            self.cfg.trail_confirm_buffer_usd,
                        )
                    }
                    _ => false,
                },
            };
            if !ok {
                return Ok(());
            }
            let pos = self.state.position.as_mut().expect("armed position");
            pos.trail_confirmed = true;
            self.dirty = true;
            self.events
                .emit("TRAIL_CONFIRMED", json!({ "trade_key": pos.trade_key }));
        }

        let may = {
            let pos = self.state.position.as_mut().expect("armed position");
            pos.trail_wd.may_attempt(now, self.cfg.watchdog_max_attempts)
        };
        if !may {
            return Ok(());
        }

        // Resize before moving: the stop must never cover more than the
        // live remainder (overselling on trigger is a real loss).
        if sl_qty != remaining && remaining > Decimal::ZERO {
            match self
                .replace_stop(now, old_id, current_sl, remaining, "TRAIL_RESIZE")
                .await
            {
                Ok(true) => {
                    let pos = self.state.position.as_mut().expect("armed position");
                    pos.last_trail_update_s = now;
                    self.dirty = true;
                }
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.record_trail_failure(now, &e);
                    return Ok(());
                }
            }
            return Ok(());
        }

        // Desired stop from the swing engine.
        let desired = match self.trail.desired_stop(side) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "trailing feed error");
                self.events
                    .emit("TRAIL_FEED_ERROR", json!({ "error": e.to_string() }));
                return Ok(());
            }
        };
        let Some(desired) = desired else {
            return Ok(());
        };
        let desired = match side {
            Side::Long => floor_to_step(desired, self.cfg.tick_size),
            Side::Short => ceil_to_step(desired, self.cfg.tick_size),
        };

        if !favorable_move(side, current_sl, desired, self.cfg.trail_step_usd) {
            return Ok(());
        }
        // Never move the trigger through the market.
        if let Some(mid) = self.mid.mid() {
            let through = match side {
                Side::Long => desired >= mid,
                Side::Short => desired <= mid,
            };
            if through {
                debug!(desired = %desired, mid = %mid, "desired stop is through the market — skipping");
                return Ok(());
            }
        }

        match self
            .replace_stop(now, old_id, desired, remaining, "TRAIL_MOVE")
            .await
        {
            Ok(true) => {
                let pos = self.state.position.as_mut().expect("armed position");
                pos.last_trail_update_s = now;
                pos.trail_wd.reset();
                self.dirty = true;
                let trade_key = pos.trade_key.clone();
                self.events.emit(
                    "TRAIL_MOVED",
                    json!({
                        "trade_key": trade_key,
                        "from": current_sl.to_string(),
                        "to": desired.to_string(),
                    }),
                );
            }
            Ok(false) => {}
            Err(e) => self.record_trail_failure(now, &e),
        }
        Ok(())
    }

    fn record_trail_failure(&mut self, now: u64, e: &anyhow::Error) {
        let pos = self.state.position.as_mut().expect("armed position");
        pos.trail_wd.record_failure(
            &e.to_string(),
            now,
            self.cfg.sl_watchdog_retry_sec,
            self.cfg.watchdog_max_attempts,
            self.cfg.watchdog_cooldown_sec,
        );
        self.dirty = true;
        let trade_key = pos.trade_key.clone();
        self.events.emit(
            "TRAIL_RETRY",
            json!({ "trade_key": trade_key, "error": e.to_string() }),
        );
    }

    // -------------------------------------------------------------------------
    // Orphan cleanup
    // -------------------------------------------------------------------------

    /// Cancel the previous stop if it is somehow still resting (the orphan
    /// slot). Pure housekeeping: failures wait for the next window.
    async fn cleanup_orphans(&mut self, now: u64) {
        let due = {
            let pos = self.state.position.as_ref().expect("armed position");
            pos.sl_prev_id.is_some() && now >= pos.cleanup_next_s
        };
        if !due {
            return;
        }
        let prev_id = {
            let pos = self.state.position.as_mut().expect("armed position");
            pos.cleanup_next_s = now + self.cfg.close_cleanup_retry_sec;
            self.dirty = true;
            pos.sl_prev_id.expect("checked above")
        };

        match self.client.order_status(&self.cfg.symbol, prev_id).await {
            Ok(info) if info.status.is_live() => {
                if let Err(e) = self.client.cancel(&self.cfg.symbol, prev_id).await {
                    warn!(order_id = prev_id, error = %e, "orphan stop cancel failed");
                    return;
                }
                let pos = self.state.position.as_mut().expect("armed position");
                pos.sl_prev_id = None;
                self.dirty = true;
            }
            Ok(info) => {
                let pos = self.state.position.as_mut().expect("armed position");
                pos.observe(OrderKey::SlPrev, info.status, now);
                pos.sl_prev_id = None;
                self.dirty = true;
            }
            Err(e) => {
                debug!(order_id = prev_id, error = %e, "orphan status poll failed");
            }
        }
    }
}

/// Is `desired` a favourable stop move of at least `step` versus `current`?
pub fn favorable_move(side: Side, current: Decimal, desired: Decimal, step: Decimal) -> bool {
    match side {
        Side::Long => desired >= current + step,
        Side::Short => desired <= current - step,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn favorable_move_requires_full_step() {
        // Long stops only ratchet upward.
        assert!(favorable_move(Side::Long, dec!(94800), dec!(94850), dec!(50)));
        assert!(!favorable_move(Side::Long, dec!(94800), dec!(94849), dec!(50)));
        assert!(!favorable_move(Side::Long, dec!(94800), dec!(94700), dec!(50)));
        // Short stops only ratchet downward.
        assert!(favorable_move(Side::Short, dec!(95200), dec!(95150), dec!(50)));
        assert!(!favorable_move(Side::Short, dec!(95200), dec!(95151), dec!(50)));
        assert!(!favorable_move(Side::Short, dec!(95200), dec!(95300), dec!(50)));
    }

    #[test]
    fn now_s_is_sane() {
        // Past 2020, below 2100.
        let n = now_s();
        assert!(n > 1_577_836_800);
        assert!(n < 4_102_444_800);
    }
}
