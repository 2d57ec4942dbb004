// =============================================================================
// Exit-safety planner — pure decision function for the position watchdogs
// =============================================================================
//
// Given the position, the open-orders snapshot, the mid price, and the
// per-order last-known statuses, produce a plan: detections (facts worth
// logging once) and actions (what the tick should execute). No side effects
// and no I/O — the tick is the impure orchestrator, this module encodes the
// decisions, and the tests below exercise every policy in isolation.
//
// Policies:
//   * terminal stop      — stop FILLED (or sl_done): finalize, nothing else.
//   * SL partial         — stop shows executedQty > 0 while still live:
//                          cancel the remainder and market-flatten it.
//   * SL slippage        — mid crossed the stop beyond a grace period while
//                          the stop is still non-terminal: market fallback.
//   * TP1 missing+crossed — TP1 evaporated and price ran through it:
//                          market-close qty1, then break-even transition.
//   * TP2 missing+crossed — TP2 evaporated and price ran through it:
//                          synthetic trailing on qty2 + qty3 (TP2 never
//                          filled), or a plain market close when the split
//                          degraded and trailing is forbidden.
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;

use crate::binance::client::LiveOrder;
use crate::position::Position;
use crate::types::{OrderKey, OrderStatus, PositionStatus, Side};

/// Everything the planner may recommend. The tick executes actions under
/// the cancel-first discipline; the planner only decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlannedAction {
    /// Cancel a tracked order (always verified before any replacement).
    CancelOrder {
        key: OrderKey,
        order_id: u64,
        reason: String,
    },
    /// Market-flatten `qty` as the stop's fallback.
    PlaceStopMarketFallback { qty: Decimal },
    /// Market-close one take-profit leg whose order evaporated.
    MarketCloseLeg { key: OrderKey, qty: Decimal },
    /// Enable trailing over `qty` without a TP2 fill.
    ActivateSyntheticTrailing { qty: Decimal },
    /// The position is terminally closed on the exchange side.
    Finalize { reason: String },
}

/// Facts the tick logs (one-shot) and bookkeeping hints it applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Detection {
    /// Mid price crossed the stop this tick; start the grace clock.
    SlCrossedStart,
    /// Mid price is back on the safe side; clear the grace clock.
    SlCrossedClear,
    SlPartialFill { executed: Decimal, remaining: Decimal },
    SlSlippage { mid: Decimal, stop: Decimal },
    Tp1MissingCrossed { status: OrderStatus },
    Tp2MissingCrossed { status: OrderStatus },
    StopFilled,
}

/// A tick's worth of watchdog output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub detections: Vec<Detection>,
    pub actions: Vec<PlannedAction>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.actions.is_empty()
    }
}

/// Planner inputs: observed world state, all by reference.
pub struct PlannerCtx<'a> {
    pub pos: &'a Position,
    pub orders: &'a [LiveOrder],
    /// Whether the open-orders snapshot is fresh enough to prove absence.
    pub orders_fresh: bool,
    pub mid: Option<Decimal>,
    pub now_s: u64,
}

/// Planner tuning, extracted from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlannerCfg {
    pub sl_watchdog_grace_sec: u64,
    pub recon_fresh_sec: u64,
    pub tick_size: Decimal,
}

/// Compute the watchdog plan for one tick.
pub fn plan(ctx: &PlannerCtx<'_>, cfg: &PlannerCfg) -> Plan {
    let pos = ctx.pos;
    let mut out = Plan::default();

    // Watchdogs only guard an armed position.
    if pos.status != PositionStatus::OpenFilled || pos.halted {
        return out;
    }

    // --- Terminal stop -------------------------------------------------------
    if pos.sl_done {
        out.actions.push(PlannedAction::Finalize {
            reason: "SL_DONE".into(),
        });
        return out;
    }
    if pos.fresh_status(OrderKey::Sl, ctx.now_s, cfg.recon_fresh_sec) == Some(OrderStatus::Filled)
    {
        out.detections.push(Detection::StopFilled);
        out.actions.push(PlannedAction::Finalize {
            reason: "SL_FILLED".into(),
        });
        return out;
    }

    // --- SL absent entirely --------------------------------------------------
    // A stop with no order id on an armed position is an interrupted
    // transition (e.g. a crash between cancel and flatten). The break-even
    // machine owns its own gap; everything else gets the market fallback.
    if pos.sl_id.is_none() && !pos.tp1_be_pending {
        let qty = pos.remaining_qty();
        if qty > Decimal::ZERO {
            out.actions
                .push(PlannedAction::PlaceStopMarketFallback { qty });
        }
        return out;
    }

    // --- SL partial ----------------------------------------------------------
    if let Some(sl_id) = pos.sl_id {
        if let Some(live) = ctx.orders.iter().find(|o| o.order_id == sl_id) {
            if live.status.is_live() && live.executed_qty > Decimal::ZERO {
                let remaining = live.orig_qty - live.executed_qty;
                if !pos.sl_wd_partial_logged {
                    out.detections.push(Detection::SlPartialFill {
                        executed: live.executed_qty,
                        remaining,
                    });
                }
                out.actions.push(PlannedAction::CancelOrder {
                    key: OrderKey::Sl,
                    order_id: sl_id,
                    reason: "SL_PARTIAL".into(),
                });
                out.actions
                    .push(PlannedAction::PlaceStopMarketFallback { qty: remaining });
                return out;
            }
        }
    }

    // --- SL slippage ---------------------------------------------------------
    if let (Some(mid), Some(sl_id)) = (ctx.mid, pos.sl_id) {
        let crossed = match pos.side {
            Side::Long => mid <= pos.sl - cfg.tick_size,
            Side::Short => mid >= pos.sl + cfg.tick_size,
        };
        if crossed {
            if pos.sl_cross_since_s == 0 {
                out.detections.push(Detection::SlCrossedStart);
            } else if ctx.now_s.saturating_sub(pos.sl_cross_since_s)
                >= cfg.sl_watchdog_grace_sec
                && stop_still_pending(pos, ctx, cfg, sl_id)
            {
                if !pos.sl_wd_slip_logged {
                    out.detections.push(Detection::SlSlippage { mid, stop: pos.sl });
                }
                out.actions.push(PlannedAction::CancelOrder {
                    key: OrderKey::Sl,
                    order_id: sl_id,
                    reason: "SL_SLIPPAGE".into(),
                });
                out.actions.push(PlannedAction::PlaceStopMarketFallback {
                    qty: pos.remaining_qty(),
                });
                return out;
            }
        } else if pos.sl_cross_since_s != 0 {
            out.detections.push(Detection::SlCrossedClear);
        }
    }

    // --- TP1 missing + price crossed ----------------------------------------
    if !pos.tp1_done {
        if let Some(tp1_id) = pos.tp1_id {
            if let Some(status) = gone_status(pos, ctx, OrderKey::Tp1, tp1_id) {
                if price_crossed(ctx.mid, pos.tp1, pos.side) {
                    if !pos.tp1_wd_missing_logged {
                        out.detections.push(Detection::Tp1MissingCrossed { status });
                    }
                    out.actions.push(PlannedAction::MarketCloseLeg {
                        key: OrderKey::Tp1,
                        qty: pos.qty1,
                    });
                    return out;
                }
            }
        }
    }

    // --- TP2 missing + price crossed ----------------------------------------
    if pos.tp1_done && !pos.tp2_done && !pos.trail_active {
        if let Some(tp2_id) = pos.tp2_id {
            if let Some(status) = gone_status(pos, ctx, OrderKey::Tp2, tp2_id) {
                if price_crossed(ctx.mid, pos.tp2, pos.side) {
                    if !pos.tp2_wd_missing_logged {
                        out.detections.push(Detection::Tp2MissingCrossed { status });
                    }
                    // TP2 never filled, so the trailing remainder is
                    // qty2 + qty3. Degraded splits cannot trail.
                    let qty = pos.qty2 + pos.qty3;
                    if pos.split_degraded {
                        out.actions
                            .push(PlannedAction::MarketCloseLeg { key: OrderKey::Tp2, qty });
                    } else {
                        out.actions
                            .push(PlannedAction::ActivateSyntheticTrailing { qty });
                    }
                    return out;
                }
            }
        }
    }

    out
}

/// The stop is still pending on the venue: visible live in a fresh
/// snapshot, or last observed in a non-terminal state.
fn stop_still_pending(
    pos: &Position,
    ctx: &PlannerCtx<'_>,
    cfg: &PlannerCfg,
    sl_id: u64,
) -> bool {
    if ctx.orders_fresh && ctx.orders.iter().any(|o| o.order_id == sl_id) {
        return true;
    }
    match pos.fresh_status(OrderKey::Sl, ctx.now_s, cfg.recon_fresh_sec) {
        Some(st) => !st.is_terminal(),
        // No fresh evidence either way — wait for the next status poll
        // instead of racing a possibly-filled stop.
        None => false,
    }
}

/// Terminal-without-fill status of a take-profit leg, corroborated by a
/// fresh snapshot that does not show the order.
fn gone_status(
    pos: &Position,
    ctx: &PlannerCtx<'_>,
    key: OrderKey,
    order_id: u64,
) -> Option<OrderStatus> {
    if !ctx.orders_fresh || ctx.orders.iter().any(|o| o.order_id == order_id) {
        return None;
    }
    let status = pos.recon.get(&key)?.status;
    status.is_gone().then_some(status)
}

/// Did the mid cross the target in the profitable direction?
fn price_crossed(mid: Option<Decimal>, target: Decimal, side: Side) -> bool {
    let Some(mid) = mid else {
        return false;
    };
    match side {
        Side::Long => mid >= target,
        Side::Short => mid <= target,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::tests::sample_position;
    use crate::snapshots::tests::live_order;
    use rust_decimal_macros::dec;

    const CFG: PlannerCfg = PlannerCfg {
        sl_watchdog_grace_sec: 30,
        recon_fresh_sec: 20,
        tick_size: Decimal::ONE,
    };

    fn ctx<'a>(
        pos: &'a Position,
        orders: &'a [LiveOrder],
        mid: Option<Decimal>,
        now_s: u64,
    ) -> PlannerCtx<'a> {
        PlannerCtx {
            pos,
            orders,
            orders_fresh: true,
            mid,
            now_s,
        }
    }

    #[test]
    fn idle_position_produces_empty_plan() {
        let pos = sample_position();
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];
        let p = plan(&ctx(&pos, &orders, Some(dec!(95100)), 1000), &CFG);
        assert!(p.is_empty());
    }

    #[test]
    fn pending_position_is_ignored() {
        let mut pos = sample_position();
        pos.status = PositionStatus::Pending;
        let p = plan(&ctx(&pos, &[], Some(dec!(90000)), 1000), &CFG);
        assert!(p.is_empty());
    }

    #[test]
    fn sl_done_short_circuits_to_finalize() {
        let mut pos = sample_position();
        pos.sl_done = true;
        let p = plan(&ctx(&pos, &[], Some(dec!(90000)), 1000), &CFG);
        assert_eq!(
            p.actions,
            vec![PlannedAction::Finalize {
                reason: "SL_DONE".into()
            }]
        );
        assert!(p.detections.is_empty());
    }

    #[test]
    fn filled_stop_finalizes_and_detects() {
        let mut pos = sample_position();
        pos.observe(OrderKey::Sl, OrderStatus::Filled, 995);
        let p = plan(&ctx(&pos, &[], None, 1000), &CFG);
        assert_eq!(p.detections, vec![Detection::StopFilled]);
        assert_eq!(
            p.actions,
            vec![PlannedAction::Finalize {
                reason: "SL_FILLED".into()
            }]
        );
    }

    #[test]
    fn stale_filled_observation_does_not_finalize() {
        let mut pos = sample_position();
        pos.observe(OrderKey::Sl, OrderStatus::Filled, 900);
        // 100 s old with a 20 s freshness gate: not trusted.
        let p = plan(&ctx(&pos, &[], None, 1000), &CFG);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn missing_stop_plans_unpaired_fallback() {
        let mut pos = sample_position();
        pos.sl_id = None;
        let p = plan(&ctx(&pos, &[], None, 1000), &CFG);
        assert_eq!(
            p.actions,
            vec![PlannedAction::PlaceStopMarketFallback { qty: dec!(0.00100) }]
        );
    }

    #[test]
    fn missing_stop_during_break_even_is_left_to_the_be_machine() {
        let mut pos = sample_position();
        pos.sl_id = None;
        pos.tp1_be_pending = true;
        pos.tp1_done = true;
        let p = plan(&ctx(&pos, &[], None, 1000), &CFG);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn sl_partial_plans_cancel_then_flatten() {
        let pos = sample_position();
        let mut sl = live_order(2, OrderStatus::PartiallyFilled);
        sl.orig_qty = dec!(0.00100);
        sl.executed_qty = dec!(0.00060);
        let orders = vec![sl];

        let p = plan(&ctx(&pos, &orders, Some(dec!(94900)), 1000), &CFG);
        assert_eq!(
            p.detections,
            vec![Detection::SlPartialFill {
                executed: dec!(0.00060),
                remaining: dec!(0.00040),
            }]
        );
        assert_eq!(
            p.actions,
            vec![
                PlannedAction::CancelOrder {
                    key: OrderKey::Sl,
                    order_id: 2,
                    reason: "SL_PARTIAL".into(),
                },
                PlannedAction::PlaceStopMarketFallback { qty: dec!(0.00040) },
            ]
        );
    }

    #[test]
    fn sl_partial_detection_is_one_shot() {
        let mut pos = sample_position();
        pos.sl_wd_partial_logged = true;
        let mut sl = live_order(2, OrderStatus::PartiallyFilled);
        sl.orig_qty = dec!(0.00100);
        sl.executed_qty = dec!(0.00060);
        let orders = vec![sl];

        let p = plan(&ctx(&pos, &orders, None, 1000), &CFG);
        // Actions persist while the condition holds; detection is gone.
        assert!(p.detections.is_empty());
        assert_eq!(p.actions.len(), 2);
    }

    #[test]
    fn sl_cross_starts_grace_clock() {
        let pos = sample_position();
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];
        // Mid 94798 is a tick below the 94800 stop.
        let p = plan(&ctx(&pos, &orders, Some(dec!(94798)), 1000), &CFG);
        assert_eq!(p.detections, vec![Detection::SlCrossedStart]);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn sl_recross_clears_grace_clock() {
        let mut pos = sample_position();
        pos.sl_cross_since_s = 950;
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];
        let p = plan(&ctx(&pos, &orders, Some(dec!(94900)), 1000), &CFG);
        assert_eq!(p.detections, vec![Detection::SlCrossedClear]);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn sl_slippage_after_grace_plans_fallback() {
        let mut pos = sample_position();
        pos.sl_cross_since_s = 960;
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];

        // 40 s past the crossing with a 30 s grace.
        let p = plan(&ctx(&pos, &orders, Some(dec!(94790)), 1000), &CFG);
        assert_eq!(
            p.detections,
            vec![Detection::SlSlippage {
                mid: dec!(94790),
                stop: dec!(94800),
            }]
        );
        assert_eq!(
            p.actions,
            vec![
                PlannedAction::CancelOrder {
                    key: OrderKey::Sl,
                    order_id: 2,
                    reason: "SL_SLIPPAGE".into(),
                },
                PlannedAction::PlaceStopMarketFallback { qty: dec!(0.00100) },
            ]
        );
    }

    #[test]
    fn sl_slippage_within_grace_does_nothing() {
        let mut pos = sample_position();
        pos.sl_cross_since_s = 990;
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];
        let p = plan(&ctx(&pos, &orders, Some(dec!(94790)), 1000), &CFG);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn sl_slippage_without_pending_evidence_waits() {
        let mut pos = sample_position();
        pos.sl_cross_since_s = 900;
        // Snapshot does not show the stop and the recon cache is empty:
        // the stop may have just filled; wait for the status poll.
        let p = plan(&ctx(&pos, &[], Some(dec!(94790)), 1000), &CFG);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn tp1_missing_crossed_closes_leg_at_market() {
        let mut pos = sample_position();
        pos.observe(OrderKey::Tp1, OrderStatus::Canceled, 995);
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];

        let p = plan(&ctx(&pos, &orders, Some(dec!(95250)), 1000), &CFG);
        assert_eq!(
            p.detections,
            vec![Detection::Tp1MissingCrossed {
                status: OrderStatus::Canceled
            }]
        );
        assert_eq!(
            p.actions,
            vec![PlannedAction::MarketCloseLeg {
                key: OrderKey::Tp1,
                qty: pos.qty1,
            }]
        );
    }

    #[test]
    fn tp1_missing_without_cross_waits() {
        let mut pos = sample_position();
        pos.observe(OrderKey::Tp1, OrderStatus::Canceled, 995);
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];
        // Mid below TP1: the leg can be re-placed by the operator; the
        // watchdog only acts when price ran through the target.
        let p = plan(&ctx(&pos, &orders, Some(dec!(95100)), 1000), &CFG);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn tp1_still_open_is_not_missing() {
        let mut pos = sample_position();
        pos.observe(OrderKey::Tp1, OrderStatus::Canceled, 995);
        let sl = live_order(2, OrderStatus::New);
        let tp1 = live_order(3, OrderStatus::New);
        let orders = vec![sl, tp1];
        // The snapshot still shows order 3: stale cache loses.
        let p = plan(&ctx(&pos, &orders, Some(dec!(95250)), 1000), &CFG);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn tp2_missing_crossed_activates_synthetic_trailing() {
        let mut pos = sample_position();
        pos.tp1_done = true;
        pos.observe(OrderKey::Tp2, OrderStatus::Expired, 995);
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];

        let p = plan(&ctx(&pos, &orders, Some(dec!(95450)), 1000), &CFG);
        assert_eq!(
            p.detections,
            vec![Detection::Tp2MissingCrossed {
                status: OrderStatus::Expired
            }]
        );
        // TP2 never filled: the trailing quantity is qty2 + qty3.
        assert_eq!(
            p.actions,
            vec![PlannedAction::ActivateSyntheticTrailing {
                qty: pos.qty2 + pos.qty3,
            }]
        );
    }

    #[test]
    fn degraded_split_market_closes_instead_of_trailing() {
        let mut pos = sample_position();
        pos.tp1_done = true;
        pos.split_degraded = true;
        pos.observe(OrderKey::Tp2, OrderStatus::Missing, 995);
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];

        let p = plan(&ctx(&pos, &orders, Some(dec!(95450)), 1000), &CFG);
        assert_eq!(
            p.actions,
            vec![PlannedAction::MarketCloseLeg {
                key: OrderKey::Tp2,
                qty: pos.qty2 + pos.qty3,
            }]
        );
    }

    #[test]
    fn stale_snapshot_cannot_prove_absence() {
        let mut pos = sample_position();
        pos.observe(OrderKey::Tp1, OrderStatus::Canceled, 995);
        let mut c = ctx(&pos, &[], Some(dec!(95250)), 1000);
        c.orders_fresh = false;
        let p = plan(&c, &CFG);
        assert!(p.actions.is_empty());
    }

    #[test]
    fn short_side_crossing_is_mirrored() {
        let mut pos = sample_position();
        pos.side = Side::Short;
        pos.entry = dec!(95000.00);
        pos.sl = dec!(95200.00);
        pos.tp1 = dec!(94800.00);
        pos.tp2 = dec!(94600.00);
        pos.observe(OrderKey::Tp1, OrderStatus::Canceled, 995);
        let sl = live_order(2, OrderStatus::New);
        let orders = vec![sl];

        // Price dropped through TP1 for a short.
        let p = plan(&ctx(&pos, &orders, Some(dec!(94750)), 1000), &CFG);
        assert_eq!(
            p.actions,
            vec![PlannedAction::MarketCloseLeg {
                key: OrderKey::Tp1,
                qty: pos.qty1,
            }]
        );
    }
}
