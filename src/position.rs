// =============================================================================
// Position model — the single mutable entity of the engine
// =============================================================================
//
// One position at a time, identified by an opaque `trade_key` that is never
// reused. Quantities are carried per exit leg so that
// `qty1 + qty2 + qty3 == qty_total` holds exactly in step-units.
//
// Every field carries a serde default: state files written by older builds
// must keep loading.
// =============================================================================

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::steps::LegSplit;
use crate::types::{OrderKey, OrderStatus, PositionStatus, Side};

/// Last-known exchange status for one tracked order, with the observation
/// time used as a freshness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedStatus {
    pub status: OrderStatus,
    pub observed_at_s: u64,
}

/// Bounded-retry substate for one cancel-verify-replace family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelVerify {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_s: u64,
    /// Executed quantity of the old order recorded before the cancel was
    /// sent; the post-market verify compares against this.
    #[serde(default)]
    pub executed_before_cancel: Decimal,
    #[serde(default)]
    pub last_status: Option<OrderStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CancelVerify {
    /// Register a failed attempt; after `max_attempts` the family sleeps for
    /// `cooldown_sec` and then the counter resets.
    pub fn record_failure(&mut self, err: &str, now_s: u64, retry_sec: u64, max_attempts: u32, cooldown_sec: u64) {
        self.attempts += 1;
        self.last_error = Some(err.to_string());
        self.next_attempt_s = if self.attempts >= max_attempts {
            now_s + cooldown_sec
        } else {
            now_s + retry_sec
        };
    }

    /// True when an attempt may run now. Resets the counter once a full
    /// cooldown has elapsed after the cap.
    pub fn may_attempt(&mut self, now_s: u64, max_attempts: u32) -> bool {
        if now_s < self.next_attempt_s {
            return false;
        }
        if self.attempts >= max_attempts {
            // Cooldown elapsed — re-arm.
            self.attempts = 0;
            self.last_error = None;
        }
        true
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_s = 0;
        self.executed_before_cancel = Decimal::ZERO;
        self.last_status = None;
        self.last_error = None;
    }
}

/// The single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Opaque identity, stable across the life-cycle, never reused.
    pub trade_key: String,
    pub symbol: String,
    pub side: Side,
    pub status: PositionStatus,

    // --- Quantities -----------------------------------------------------------
    pub qty_total: Decimal,
    pub qty1: Decimal,
    pub qty2: Decimal,
    pub qty3: Decimal,
    /// True when the split degraded to 50/50/0; trailing is forbidden.
    #[serde(default)]
    pub split_degraded: bool,

    // --- Prices ---------------------------------------------------------------
    pub entry: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp1: Decimal,
    #[serde(default)]
    pub tp2: Decimal,

    // --- Order identifiers ----------------------------------------------------
    #[serde(default)]
    pub entry_id: Option<u64>,
    #[serde(default)]
    pub sl_id: Option<u64>,
    #[serde(default)]
    pub tp1_id: Option<u64>,
    #[serde(default)]
    pub tp2_id: Option<u64>,
    /// Orphan slot for the previous stop after a replacement.
    #[serde(default)]
    pub sl_prev_id: Option<u64>,
    /// Quantity the current stop order covers; shrinks as legs fill.
    #[serde(default)]
    pub sl_qty: Decimal,

    // --- Progress flags -------------------------------------------------------
    #[serde(default)]
    pub tp1_done: bool,
    #[serde(default)]
    pub tp2_done: bool,
    #[serde(default)]
    pub sl_done: bool,
    #[serde(default)]
    pub trail_active: bool,
    /// Trailing was activated on the emergency path (TP2 never filled).
    #[serde(default)]
    pub tp2_synthetic: bool,
    /// Bar-close confirmation cleared (always true when the confirm buffer
    /// is zero).
    #[serde(default)]
    pub trail_confirmed: bool,

    // --- Break-even transition (decoupled from TP1 detection) -----------------
    #[serde(default)]
    pub tp1_be_pending: bool,
    #[serde(default)]
    pub tp1_be_old_sl: Option<u64>,
    #[serde(default)]
    pub tp1_be_attempts: u32,
    #[serde(default)]
    pub tp1_be_next_s: u64,

    // --- Watchdog substates ---------------------------------------------------
    #[serde(default)]
    pub sl_wd: CancelVerify,
    #[serde(default)]
    pub trail_wd: CancelVerify,

    // --- One-shot detection-log flags ----------------------------------------
    #[serde(default)]
    pub sl_wd_partial_logged: bool,
    #[serde(default)]
    pub sl_wd_slip_logged: bool,
    #[serde(default)]
    pub tp1_wd_missing_logged: bool,
    #[serde(default)]
    pub tp2_wd_missing_logged: bool,

    // --- Throttle timestamps (epoch seconds) ----------------------------------
    #[serde(default)]
    pub entry_poll_next_s: u64,
    #[serde(default)]
    pub tp1_poll_next_s: u64,
    #[serde(default)]
    pub tp2_poll_next_s: u64,
    #[serde(default)]
    pub sl_poll_next_s: u64,
    #[serde(default)]
    pub cleanup_next_s: u64,
    #[serde(default)]
    pub trail_next_s: u64,
    #[serde(default)]
    pub recon_next_s: u64,
    #[serde(default)]
    pub exits_retry_next_s: u64,

    // --- Entry management -----------------------------------------------------
    /// Deadline for the LIMIT entry before Plan B kicks in.
    #[serde(default)]
    pub entry_deadline_s: u64,
    /// Prospective risk unit (entry − percentage stop) fixed at placement,
    /// used by the Plan B deviation guard before real exits exist.
    #[serde(default)]
    pub planned_r: Decimal,
    #[serde(default)]
    pub planned_tp1: Decimal,

    // --- Exit placement failsafe ----------------------------------------------
    #[serde(default)]
    pub exit_place_tries: u32,
    /// Failsafe exhausted without flatten: operator must intervene.
    #[serde(default)]
    pub halted: bool,

    // --- Trailing bookkeeping -------------------------------------------------
    #[serde(default)]
    pub last_trail_update_s: u64,

    /// When the mid price first crossed the stop (0 = not crossed); the
    /// slippage watchdog waits out its grace period from here.
    #[serde(default)]
    pub sl_cross_since_s: u64,

    // --- Reconciliation cache -------------------------------------------------
    /// Last-known exchange status per tracked order slot.
    #[serde(default)]
    pub recon: BTreeMap<OrderKey, ObservedStatus>,

    // --- Timestamps -----------------------------------------------------------
    pub opened_at: String,
}

impl Position {
    /// Remaining quantity not yet closed by a filled leg.
    pub fn remaining_qty(&self) -> Decimal {
        let mut rem = self.qty_total;
        if self.tp1_done {
            rem -= self.qty1;
        }
        if self.tp2_done && !self.tp2_synthetic {
            rem -= self.qty2;
        }
        rem
    }

    /// Apply a computed leg split.
    pub fn apply_split(&mut self, split: &LegSplit) {
        self.qty1 = split.qty1;
        self.qty2 = split.qty2;
        self.qty3 = split.qty3;
        self.split_degraded = split.degraded;
    }

    /// Record an exchange observation in the reconciliation cache.
    pub fn observe(&mut self, key: OrderKey, status: OrderStatus, now_s: u64) {
        self.recon.insert(
            key,
            ObservedStatus {
                status,
                observed_at_s: now_s,
            },
        );
    }

    /// Cached status for `key` if observed within `fresh_sec`.
    pub fn fresh_status(&self, key: OrderKey, now_s: u64, fresh_sec: u64) -> Option<OrderStatus> {
        self.recon.get(&key).and_then(|obs| {
            if now_s.saturating_sub(obs.observed_at_s) <= fresh_sec {
                Some(obs.status)
            } else {
                None
            }
        })
    }

    /// Price-hierarchy invariant: `sl < entry < tp1 < tp2` for longs,
    /// reversed for shorts. Degraded positions have no TP2 constraint once
    /// `qty3` is zero and `tp2` is unset.
    pub fn prices_coherent(&self) -> bool {
        if self.sl == Decimal::ZERO || self.tp1 == Decimal::ZERO {
            // Exits not computed yet.
            return true;
        }
        let tp2_ok = |a: Decimal, b: Decimal| self.tp2 == Decimal::ZERO || a < b;
        match self.side {
            Side::Long => {
                self.sl < self.entry && self.entry < self.tp1 && tp2_ok(self.tp1, self.tp2)
            }
            Side::Short => {
                self.sl > self.entry && self.entry > self.tp1 && tp2_ok(self.tp2, self.tp1)
            }
        }
    }
}

/// Terminal snapshot of the previous position, kept for reporting while the
/// slot is empty and the cooldown runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastClosed {
    pub trade_key: String,
    pub side: Side,
    pub entry: Decimal,
    pub qty_total: Decimal,
    pub tp1_done: bool,
    pub tp2_done: bool,
    pub trail_active: bool,
    pub reason: String,
    pub closed_at: String,
    /// Epoch seconds of the close, drives the I13 post-close debt check.
    #[serde(default)]
    pub closed_at_s: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::steps::split_three_legs;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_position() -> Position {
        let mut pos = Position {
            trade_key: "tk-test".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            status: PositionStatus::OpenFilled,
            qty_total: dec!(0.00100),
            qty1: Decimal::ZERO,
            qty2: Decimal::ZERO,
            qty3: Decimal::ZERO,
            split_degraded: false,
            entry: dec!(95000.50),
            sl: dec!(94800.00),
            tp1: dec!(95200.00),
            tp2: dec!(95400.00),
            entry_id: Some(1),
            sl_id: Some(2),
            tp1_id: Some(3),
            tp2_id: Some(4),
            sl_prev_id: None,
            sl_qty: dec!(0.00100),
            tp1_done: false,
            tp2_done: false,
            sl_done: false,
            trail_active: false,
            tp2_synthetic: false,
            trail_confirmed: true,
            tp1_be_pending: false,
            tp1_be_old_sl: None,
            tp1_be_attempts: 0,
            tp1_be_next_s: 0,
            sl_wd: CancelVerify::default(),
            trail_wd: CancelVerify::default(),
            sl_wd_partial_logged: false,
            sl_wd_slip_logged: false,
            tp1_wd_missing_logged: false,
            tp2_wd_missing_logged: false,
            entry_poll_next_s: 0,
            tp1_poll_next_s: 0,
            tp2_poll_next_s: 0,
            sl_poll_next_s: 0,
            cleanup_next_s: 0,
            trail_next_s: 0,
            recon_next_s: 0,
            exits_retry_next_s: 0,
            entry_deadline_s: 0,
            planned_r: dec!(200),
            planned_tp1: dec!(95200.00),
            exit_place_tries: 0,
            halted: false,
            last_trail_update_s: 0,
            sl_cross_since_s: 0,
            recon: BTreeMap::new(),
            opened_at: "2025-01-13T20:00:00Z".into(),
        };
        pos.apply_split(&split_three_legs(pos.qty_total, dec!(0.00001), dec!(0.00001)));
        pos
    }

    #[test]
    fn legs_sum_to_total() {
        let pos = sample_position();
        assert_eq!(pos.qty1 + pos.qty2 + pos.qty3, pos.qty_total);
    }

    #[test]
    fn remaining_qty_tracks_leg_fills() {
        let mut pos = sample_position();
        assert_eq!(pos.remaining_qty(), pos.qty_total);
        pos.tp1_done = true;
        assert_eq!(pos.remaining_qty(), pos.qty2 + pos.qty3);
        pos.tp2_done = true;
        assert_eq!(pos.remaining_qty(), pos.qty3);
    }

    #[test]
    fn synthetic_tp2_keeps_qty2_in_remainder() {
        let mut pos = sample_position();
        pos.tp1_done = true;
        pos.tp2_done = true;
        pos.tp2_synthetic = true;
        assert_eq!(pos.remaining_qty(), pos.qty2 + pos.qty3);
    }

    #[test]
    fn price_hierarchy_long_and_short() {
        let mut pos = sample_position();
        assert!(pos.prices_coherent());
        pos.sl = dec!(96000);
        assert!(!pos.prices_coherent());

        let mut short = sample_position();
        short.side = Side::Short;
        short.sl = dec!(95200.00);
        short.tp1 = dec!(94800.00);
        short.tp2 = dec!(94600.00);
        short.entry = dec!(95000.00);
        assert!(short.prices_coherent());
    }

    #[test]
    fn serde_roundtrip_is_fixed_point() {
        let pos = sample_position();
        let json = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn fresh_status_gates_on_age() {
        let mut pos = sample_position();
        pos.observe(OrderKey::Sl, OrderStatus::New, 1000);
        assert_eq!(pos.fresh_status(OrderKey::Sl, 1010, 20), Some(OrderStatus::New));
        assert_eq!(pos.fresh_status(OrderKey::Sl, 1030, 20), None);
        assert_eq!(pos.fresh_status(OrderKey::Tp1, 1000, 20), None);
    }

    #[test]
    fn cancel_verify_cap_and_cooldown_rearm() {
        let mut cv = CancelVerify::default();
        let (retry, max, cool) = (30u64, 3u32, 3600u64);
        let mut now = 1000u64;

        for _ in 0..3 {
            assert!(cv.may_attempt(now, max));
            cv.record_failure("insufficient balance", now, retry, max, cool);
            now = cv.next_attempt_s;
        }
        // Capped: next attempt only after the cooldown.
        assert_eq!(cv.attempts, 3);
        assert!(!cv.may_attempt(now - 1, max));
        // After the cooldown the counter re-arms.
        assert!(cv.may_attempt(now, max));
        assert_eq!(cv.attempts, 0);
    }
}
