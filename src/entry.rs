// =============================================================================
// Entry flow helpers — price/quantity sizing and the Plan B guard
// =============================================================================
//
// The tick drives the entry state machine; this module holds the arithmetic
// and the order placement. Entry placement prefers a marketable LIMIT at
// `close + offset`; when the fill does not arrive within the timeout, Plan B
// decides between falling back to MARKET and aborting.
// =============================================================================

use anyhow::{bail, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::binance::client::{BinanceClient, PlacedOrder};
use crate::config::Config;
use crate::position::Position;
use crate::steps::{floor_to_step, round_directional};
use crate::types::{PlanBDevRule, PositionStatus, Side};

/// Entry limit price: signal close plus the configured offset, rounded
/// directionally to tick (up for longs, down for shorts — marketable).
pub fn entry_price(cfg: &Config, side: Side, signal_price: Decimal) -> Decimal {
    let raw = match side {
        Side::Long => signal_price + cfg.entry_offset_usd,
        Side::Short => signal_price - cfg.entry_offset_usd,
    };
    round_directional(raw, cfg.tick_size, side.is_long())
}

/// Quantity from the notional target, floored to lot step and validated
/// against the venue minimums.
pub fn entry_qty(cfg: &Config, entry: Decimal) -> Result<Decimal> {
    if entry <= Decimal::ZERO {
        bail!("entry price must be positive, got {entry}");
    }
    let qty = floor_to_step(cfg.qty_usd / entry, cfg.qty_step);
    if qty < cfg.min_qty {
        bail!("quantity {qty} below venue minimum {}", cfg.min_qty);
    }
    if qty * entry < cfg.min_notional {
        bail!(
            "notional {} below venue minimum {}",
            qty * entry,
            cfg.min_notional
        );
    }
    Ok(qty)
}

/// Plan B verdict when the LIMIT entry timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlanB {
    /// Fall back to a MARKET entry at the current price.
    FallbackMarket,
    /// Cancel the entry and give up on this signal.
    Abort { reason: String },
}

/// Decide Plan B from the current executable price.
///
/// The price having already passed TP1 always aborts (the trade's edge is
/// spent). Deviation aborts combine per `PLANB_DEV_RULE`: `either` aborts
/// when one threshold is exceeded, `both` only when both are.
pub fn planb_decide(
    cfg: &Config,
    side: Side,
    entry: Decimal,
    planned_r: Decimal,
    planned_tp1: Decimal,
    mid: Decimal,
) -> PlanB {
    let passed_tp1 = match side {
        Side::Long => mid >= planned_tp1,
        Side::Short => mid <= planned_tp1,
    };
    if passed_tp1 {
        return PlanB::Abort {
            reason: format!("price {mid} already beyond TP1 {planned_tp1}"),
        };
    }

    let dev = (mid - entry).abs();
    let dev_usd_exceeded = dev > cfg.planb_max_dev_usd;
    let dev_r_exceeded = planned_r > Decimal::ZERO && dev > planned_r * cfg.planb_max_dev_r_mult;

    let abort = match cfg.planb_dev_rule {
        PlanBDevRule::Either => dev_usd_exceeded || dev_r_exceeded,
        PlanBDevRule::Both => dev_usd_exceeded && dev_r_exceeded,
    };
    if abort {
        PlanB::Abort {
            reason: format!(
                "deviation {dev} exceeds limits (usd={}, r_mult={})",
                cfg.planb_max_dev_usd, cfg.planb_max_dev_r_mult
            ),
        }
    } else {
        PlanB::FallbackMarket
    }
}

/// Generate the opaque trade identity. Never reused; the client order ids
/// of every order in the life-cycle embed its prefix.
pub fn new_trade_key() -> String {
    Uuid::new_v4().to_string()
}

/// Place the entry order and build the fresh position record.
///
/// LIMIT_ONLY and LIMIT_THEN_MARKET start with a LIMIT (status Pending);
/// MARKET_ONLY fills immediately (status Open, exits still to be placed).
/// The caller generates `trade_key` up front so the margin borrow can be
/// recorded against it before any order exists.
#[allow(clippy::too_many_arguments)]
pub async fn place_entry(
    cfg: &Config,
    client: &BinanceClient,
    trade_key: String,
    side: Side,
    entry: Decimal,
    qty: Decimal,
    side_effect: Option<&str>,
    now_s: u64,
) -> Result<Position> {
    let key8: String = trade_key.chars().take(8).collect();
    let client_id = format!("bb-{key8}-e");

    let market_entry = cfg.entry_mode == crate::types::EntryMode::MarketOnly;
    let placed: PlacedOrder = if market_entry {
        client
            .place_market(&cfg.symbol, side.entry_order_side(), qty, &client_id, side_effect)
            .await?
    } else {
        client
            .place_limit(
                &cfg.symbol,
                side.entry_order_side(),
                qty,
                entry,
                &client_id,
                side_effect,
            )
            .await?
    };

    // The prospective stop distance backs the Plan B deviation guard until
    // real exits exist.
    let pct = cfg.sl_pct / Decimal::ONE_HUNDRED;
    let planned_r = entry * pct;
    let planned_tp1 = match side {
        Side::Long => entry + planned_r * cfg.tp1_r(),
        Side::Short => entry - planned_r * cfg.tp1_r(),
    };

    let status = if market_entry {
        PositionStatus::Open
    } else {
        PositionStatus::Pending
    };

    info!(
        trade_key = %trade_key,
        order_id = placed.order_id,
        order_status = %placed.status,
        executed = %placed.executed_qty,
        side = %side,
        entry = %entry,
        qty = %qty,
        status = %status,
        "entry order placed"
    );

    Ok(Position {
        trade_key,
        symbol: cfg.symbol.clone(),
        side,
        status,
        qty_total: qty,
        qty1: Decimal::ZERO,
        qty2: Decimal::ZERO,
        qty3: Decimal::ZERO,
        split_degraded: false,
        entry,
        sl: Decimal::ZERO,
        tp1: Decimal::ZERO,
        tp2: Decimal::ZERO,
        entry_id: Some(placed.order_id),
        sl_id: None,
        tp1_id: None,
        tp2_id: None,
        sl_prev_id: None,
        sl_qty: Decimal::ZERO,
        tp1_done: false,
        tp2_done: false,
        sl_done: false,
        trail_active: false,
        tp2_synthetic: false,
        trail_confirmed: false,
        tp1_be_pending: false,
        tp1_be_old_sl: None,
        tp1_be_attempts: 0,
        tp1_be_next_s: 0,
        sl_wd: Default::default(),
        trail_wd: Default::default(),
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
        entry_deadline_s: now_s + cfg.live_entry_timeout_sec,
        planned_r,
        planned_tp1,
        exit_place_tries: 0,
        halted: false,
        last_trail_update_s: 0,
        sl_cross_since_s: 0,
        recon: Default::default(),
        opened_at: Utc::now().to_rfc3339(),
    })
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
    fn entry_price_rounds_directionally() {
        let cfg = base_config();
        // LONG: 95000.0 + 0.5 = 95000.50 (already aligned).
        assert_eq!(entry_price(&cfg, Side::Long, dec!(95000.0)), dec!(95000.50));
        // SHORT rounds down.
        assert_eq!(entry_price(&cfg, Side::Short, dec!(95000.004)), dec!(94999.50));
    }

    #[test]
    fn qty_floors_to_step_and_validates() {
        let mut cfg = base_config();
        cfg.qty_usd = dec!(100);
        let qty = entry_qty(&cfg, dec!(95000.50)).unwrap();
        // 100 / 95000.50 = 0.0010526... → 0.00105
        assert_eq!(qty, dec!(0.00105));
    }

    #[test]
    fn qty_below_min_notional_is_rejected() {
        let mut cfg = base_config();
        cfg.qty_usd = dec!(3);
        assert!(entry_qty(&cfg, dec!(95000.50)).is_err());
    }

    #[test]
    fn planb_aborts_when_price_passed_tp1() {
        let cfg = base_config();
        let verdict = planb_decide(
            &cfg,
            Side::Long,
            dec!(95000.50),
            dec!(475),
            dec!(95475.50),
            dec!(95480.00),
        );
        assert!(matches!(verdict, PlanB::Abort { .. }));
    }

    #[test]
    fn planb_either_rule_aborts_on_single_threshold() {
        let cfg = base_config();
        // dev = 200 > 150 USD limit, but under r-mult limit (0.5 * 475).
        let verdict = planb_decide(
            &cfg,
            Side::Long,
            dec!(95000.50),
            dec!(475),
            dec!(95475.50),
            dec!(95200.50),
        );
        assert!(matches!(verdict, PlanB::Abort { .. }));
    }

    #[test]
    fn planb_both_rule_needs_both_thresholds() {
        let mut cfg = base_config();
        cfg.planb_dev_rule = PlanBDevRule::Both;
        // dev = 200: exceeds USD (150) but not r-mult (237.5) → fallback.
        let verdict = planb_decide(
            &cfg,
            Side::Long,
            dec!(95000.50),
            dec!(475),
            dec!(95475.50),
            dec!(95200.50),
        );
        assert_eq!(verdict, PlanB::FallbackMarket);

        // dev = 300: exceeds both → abort.
        let verdict = planb_decide(
            &cfg,
            Side::Long,
            dec!(95000.50),
            dec!(475),
            dec!(95475.50),
            dec!(95300.50),
        );
        assert!(matches!(verdict, PlanB::Abort { .. }));
    }

    #[test]
    fn planb_small_deviation_falls_back_to_market() {
        let cfg = base_config();
        let verdict = planb_decide(
            &cfg,
            Side::Long,
            dec!(95000.50),
            dec!(475),
            dec!(95475.50),
            dec!(95050.00),
        );
        assert_eq!(verdict, PlanB::FallbackMarket);
    }

    #[test]
    fn trade_keys_are_unique() {
        let a = new_trade_key();
        let b = new_trade_key();
        assert_ne!(a, b);
    }
}
