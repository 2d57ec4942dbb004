// =============================================================================
// Exit placement — three-leg structure, validation, and the failsafe
// =============================================================================
//
// An armed position carries three reduce-side orders: a STOP_LOSS_LIMIT for
// the full quantity plus two take-profit LIMITs. Placement is
// protection-first (the stop goes in before the targets) and re-entrant: a
// retry only places the legs that are still missing.
//
// The failsafe driver lives in the tick; this module computes prices,
// validates the plan, and talks to the venue.
// =============================================================================

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::binance::client::BinanceClient;
use crate::config::Config;
use crate::position::Position;
use crate::steps::{ceil_to_step, floor_to_step, round_nearest_step};
use crate::types::Side;

/// How far through the stop trigger the protective limit sits, in ticks.
/// A marketable offset, so the stop-limit cannot rest unfilled in a fast
/// market.
const SL_LIMIT_OFFSET_TICKS: i64 = 5;

/// Computed exit structure for one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPlan {
    pub sl: Decimal,
    pub tp1: Decimal,
    pub tp2: Decimal,
}

/// Compute SL/TP prices for a filled entry.
///
/// The stop prefers the swing extreme when one is available on the correct
/// side of the entry; otherwise it falls back to the percentage stop. The
/// take-profits are R-multiples of the realized stop distance.
pub fn compute_exit_plan(
    cfg: &Config,
    side: Side,
    entry: Decimal,
    swing_stop: Option<Decimal>,
) -> ExitPlan {
    let pct = cfg.sl_pct / Decimal::ONE_HUNDRED;
    let fallback = match side {
        Side::Long => entry * (Decimal::ONE - pct),
        Side::Short => entry * (Decimal::ONE + pct),
    };

    let raw_sl = match (side, swing_stop) {
        (Side::Long, Some(s)) if s < entry => s,
        (Side::Short, Some(s)) if s > entry => s,
        _ => fallback,
    };

    // Stop rounds away from the entry; targets round to the nearest tick.
    let (sl, r) = match side {
        Side::Long => {
            let sl = floor_to_step(raw_sl, cfg.tick_size);
            (sl, entry - sl)
        }
        Side::Short => {
            let sl = ceil_to_step(raw_sl, cfg.tick_size);
            (sl, sl - entry)
        }
    };

    let (tp1, tp2) = match side {
        Side::Long => (
            round_nearest_step(entry + r * cfg.tp1_r(), cfg.tick_size),
            round_nearest_step(entry + r * cfg.tp2_r(), cfg.tick_size),
        ),
        Side::Short => (
            round_nearest_step(entry - r * cfg.tp1_r(), cfg.tick_size),
            round_nearest_step(entry - r * cfg.tp2_r(), cfg.tick_size),
        ),
    };

    ExitPlan { sl, tp1, tp2 }
}

/// Validate the price hierarchy with at least one tick of separation:
/// `sl < entry < tp1 < tp2` for longs, reversed for shorts.
pub fn validate_exit_plan(
    side: Side,
    entry: Decimal,
    plan: &ExitPlan,
    tick: Decimal,
) -> Result<()> {
    let ordered: [(Decimal, Decimal, &str); 3] = match side {
        Side::Long => [
            (plan.sl, entry, "sl < entry"),
            (entry, plan.tp1, "entry < tp1"),
            (plan.tp1, plan.tp2, "tp1 < tp2"),
        ],
        Side::Short => [
            (entry, plan.sl, "entry < sl"),
            (plan.tp1, entry, "tp1 < entry"),
            (plan.tp2, plan.tp1, "tp2 < tp1"),
        ],
    };
    for (lo, hi, what) in ordered {
        if lo + tick > hi {
            bail!(
                "exit plan violates {what} by at least one tick: {lo} vs {hi} (tick {tick})"
            );
        }
    }
    Ok(())
}

/// Place the legs that are still missing on `pos`, protection-first.
///
/// Re-entrant: legs that already carry an order id are skipped, so the
/// failsafe retry only sends what is absent. Order ids are recorded on the
/// position as soon as the venue acknowledges them — a failure halfway
/// through leaves a partially-armed position that the next retry completes.
pub async fn place_missing_legs(
    cfg: &Config,
    client: &BinanceClient,
    pos: &mut Position,
    side_effect: Option<&str>,
) -> Result<()> {
    let side = pos.side.exit_order_side();
    let attempt = pos.exit_place_tries;
    let key8: String = pos.trade_key.chars().take(8).collect();

    if pos.sl_id.is_none() {
        let offset = cfg.tick_size * Decimal::from(SL_LIMIT_OFFSET_TICKS);
        let limit = match pos.side {
            Side::Long => pos.sl - offset,
            Side::Short => pos.sl + offset,
        };
        let placed = client
            .place_stop_loss_limit(
                &cfg.symbol,
                side,
                pos.qty_total,
                pos.sl,
                limit,
                &format!("bb-{key8}-sl{attempt}"),
                side_effect,
            )
            .await
            .context("stop-loss placement failed")?;
        pos.sl_id = Some(placed.order_id);
        info!(order_id = placed.order_id, stop = %pos.sl, "stop-loss leg placed");
    }

    if pos.tp1_id.is_none() {
        let placed = client
            .place_limit(
                &cfg.symbol,
                side,
                pos.qty1,
                pos.tp1,
                &format!("bb-{key8}-tp1{attempt}"),
                side_effect,
            )
            .await
            .context("TP1 placement failed")?;
        pos.tp1_id = Some(placed.order_id);
        info!(order_id = placed.order_id, price = %pos.tp1, "TP1 leg placed");
    }

    if pos.tp2_id.is_none() {
        let placed = client
            .place_limit(
                &cfg.symbol,
                side,
                pos.qty2,
                pos.tp2,
                &format!("bb-{key8}-tp2{attempt}"),
                side_effect,
            )
            .await
            .context("TP2 placement failed")?;
        pos.tp2_id = Some(placed.order_id);
        info!(order_id = placed.order_id, price = %pos.tp2, "TP2 leg placed");
    }

    Ok(())
}

/// Market-flatten the whole remaining quantity — the last resort when the
/// exit legs cannot be placed and `FAILSAFE_FLATTEN` is on.
pub async fn market_flatten(
    cfg: &Config,
    client: &BinanceClient,
    pos: &Position,
    side_effect: Option<&str>,
    reason: &str,
) -> Result<u64> {
    let qty = pos.remaining_qty();
    warn!(qty = %qty, reason, "market-flattening position");
    let key8: String = pos.trade_key.chars().take(8).collect();
    let placed = client
        .place_market(
            &cfg.symbol,
            pos.side.exit_order_side(),
            qty,
            &format!("bb-{key8}-flat"),
            side_effect,
        )
        .await
        .context("failsafe market flatten failed")?;
    Ok(placed.order_id)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base_config;
    use rust_decimal_macros::dec;

    #[test]
    fn long_plan_from_percentage_stop() {
        let cfg = base_config();
        // SL_PCT = 0.5 % of 95000.50 → stop ≈ 94525.49, floored to tick.
        let plan = compute_exit_plan(&cfg, Side::Long, dec!(95000.50), None);
        assert_eq!(plan.sl, dec!(94525.49));
        let r = dec!(95000.50) - plan.sl;
        assert_eq!(plan.tp1, dec!(95000.50) + r);
        assert_eq!(plan.tp2, dec!(95000.50) + r * dec!(2));
        assert!(validate_exit_plan(Side::Long, dec!(95000.50), &plan, cfg.tick_size).is_ok());
    }

    #[test]
    fn swing_stop_preferred_when_on_correct_side() {
        let cfg = base_config();
        let plan = compute_exit_plan(&cfg, Side::Long, dec!(95000.50), Some(dec!(94800.00)));
        assert_eq!(plan.sl, dec!(94800.00));
        // R = 200.50 → TP1 95201.00, TP2 95401.50.
        assert_eq!(plan.tp1, dec!(95201.00));
        assert_eq!(plan.tp2, dec!(95401.50));
    }

    #[test]
    fn swing_stop_on_wrong_side_falls_back() {
        let cfg = base_config();
        // A "swing" above a long entry is useless; percentage stop wins.
        let plan = compute_exit_plan(&cfg, Side::Long, dec!(95000.50), Some(dec!(95500.00)));
        assert_eq!(plan.sl, dec!(94525.49));
    }

    #[test]
    fn short_plan_is_mirrored() {
        let cfg = base_config();
        let plan = compute_exit_plan(&cfg, Side::Short, dec!(95000.00), Some(dec!(95200.00)));
        assert_eq!(plan.sl, dec!(95200.00));
        assert_eq!(plan.tp1, dec!(94800.00));
        assert_eq!(plan.tp2, dec!(94600.00));
        assert!(validate_exit_plan(Side::Short, dec!(95000.00), &plan, cfg.tick_size).is_ok());
    }

    #[test]
    fn validation_rejects_inverted_hierarchy() {
        let tick = dec!(0.01);
        let plan = ExitPlan {
            sl: dec!(95100),
            tp1: dec!(95200),
            tp2: dec!(95400),
        };
        assert!(validate_exit_plan(Side::Long, dec!(95000), &plan, tick).is_err());
    }

    #[test]
    fn validation_requires_one_tick_of_separation() {
        let tick = dec!(0.01);
        let plan = ExitPlan {
            sl: dec!(94800),
            tp1: dec!(95000.00),
            tp2: dec!(95400),
        };
        // tp1 == entry: zero separation.
        assert!(validate_exit_plan(Side::Long, dec!(95000.00), &plan, tick).is_err());

        let plan_ok = ExitPlan {
            sl: dec!(94800),
            tp1: dec!(95000.01),
            tp2: dec!(95400),
        };
        assert!(validate_exit_plan(Side::Long, dec!(95000.00), &plan_ok, tick).is_ok());
    }
}
