// =============================================================================
// Reconciliation — attach persisted state to live exchange state
// =============================================================================
//
// Event-triggered only: boot, emergency-shutdown entry, and (throttled) PEAK
// arrival. NEVER run on a timer — a periodic reconcile races the tick's own
// mutations mid-transition and corrupts the state machine.
//
// The reconciler resolves every tracked order id against the venue, refreshes
// the per-order observation cache, and handles exactly one drastic case
// itself: the exchange is empty (no open orders, every tracked order
// terminal, no debt) while we still hold a live position — the operator
// closed it from the exchange UI. Then the slot is cleared and the cooldown
// starts. Everything else is left for the tick to act on.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::binance::client::{BinanceClient, DebtEntry, LiveOrder};
use crate::config::Config;
use crate::events::EventLog;
use crate::position::{LastClosed, Position};
use crate::snapshots::OpenOrdersSnapshot;
use crate::state_store::BotState;
use crate::types::{OrderKey, OrderStatus, TradeMode};

/// What one reconciliation pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No position to reconcile.
    NoPosition,
    /// Position kept; observations refreshed.
    Kept,
    /// Exchange was empty — position cleared, cooldown started.
    Cleared,
}

/// Pure decision: is the exchange empty of everything this position owns?
///
/// `statuses` holds the polled status of every tracked order id. Empty means
/// we could not poll anything — that is NOT proof of emptiness.
pub fn exchange_empty(
    statuses: &[(OrderKey, OrderStatus)],
    orders: &[LiveOrder],
    debts: &[DebtEntry],
) -> bool {
    if statuses.is_empty() {
        return false;
    }
    statuses.iter().all(|(_, st)| st.is_terminal())
        && orders.is_empty()
        && debts.iter().all(|d| d.total() <= rust_decimal::Decimal::ZERO)
}

/// Run one reconciliation pass against the venue.
pub async fn attach(
    cfg: &Config,
    client: &BinanceClient,
    state: &mut BotState,
    open_orders: &mut OpenOrdersSnapshot,
    events: &EventLog,
    now_s: u64,
) -> Result<ReconcileOutcome> {
    open_orders
        .refresh(client, &cfg.symbol, now_s, true)
        .await
        .context("reconcile: failed to fetch open orders")?;

    let Some(pos) = state.position.as_mut() else {
        info!("reconcile: no position — nothing to attach");
        return Ok(ReconcileOutcome::NoPosition);
    };

    info!(trade_key = %pos.trade_key, status = %pos.status, "reconcile: attaching position");

    // Drop cached statuses for legs that are already done — they are no
    // longer relevant and a stale FILLED there must not re-trigger anything.
    if pos.tp1_done {
        pos.recon.remove(&OrderKey::Tp1);
    }
    if pos.tp2_done {
        pos.recon.remove(&OrderKey::Tp2);
    }
    if pos.sl_done {
        pos.recon.remove(&OrderKey::Sl);
    }

    // Resolve every tracked id to a live order or a polled terminal status.
    let tracked: Vec<(OrderKey, u64)> = [
        (OrderKey::Entry, pos.entry_id),
        (OrderKey::Sl, pos.sl_id),
        (OrderKey::Tp1, pos.tp1_id),
        (OrderKey::Tp2, pos.tp2_id),
        (OrderKey::SlPrev, pos.sl_prev_id),
    ]
    .into_iter()
    .filter_map(|(k, id)| id.map(|id| (k, id)))
    .collect();

    let mut statuses: Vec<(OrderKey, OrderStatus)> = Vec::with_capacity(tracked.len());
    for (key, order_id) in &tracked {
        let status = if let Some(live) = open_orders.get(*order_id) {
            live.status
        } else {
            client
                .order_status(&cfg.symbol, *order_id)
                .await
                .with_context(|| format!("reconcile: status poll of {key} order failed"))?
                .status
        };
        pos.observe(*key, status, now_s);
        statuses.push((*key, status));
    }

    // Margin accounts also need the debt side of the picture.
    let debts = if cfg.trade_mode == TradeMode::Margin {
        client
            .margin_debt(&cfg.symbol)
            .await
            .context("reconcile: debt snapshot failed")?
    } else {
        Vec::new()
    };

    if exchange_empty(&statuses, open_orders.orders(), &debts) {
        let trade_key = pos.trade_key.clone();
        warn!(
            trade_key = %trade_key,
            "reconcile: exchange is empty — position was closed externally"
        );

        let last = LastClosed {
            trade_key: trade_key.clone(),
            side: pos.side,
            entry: pos.entry,
            qty_total: pos.qty_total,
            tp1_done: pos.tp1_done,
            tp2_done: pos.tp2_done,
            trail_active: pos.trail_active,
            reason: "POSITION_CLEARED_BY_EXCHANGE".into(),
            closed_at: Utc::now().to_rfc3339(),
            closed_at_s: now_s,
        };
        state.last_closed = Some(last);
        state.position = None;
        state.cooldown_until_s = now_s + cfg.cooldown_sec;
        state.margin.mark_repaid(&trade_key);

        events.emit(
            "POSITION_CLEARED_BY_EXCHANGE",
            json!({
                "trade_key": trade_key,
                "cooldown_until_s": state.cooldown_until_s,
            }),
        );
        return Ok(ReconcileOutcome::Cleared);
    }

    for o in open_orders.orders() {
        debug!(
            order_id = o.order_id,
            client_id = %o.client_order_id,
            side = %o.side,
            order_type = %o.order_type,
            price = %o.price,
            stop_price = %o.stop_price,
            "reconcile: live order"
        );
    }
    info!(
        tracked = statuses.len(),
        live_orders = open_orders.orders().len(),
        "reconcile: position kept"
    );
    Ok(ReconcileOutcome::Kept)
}

/// Restore the cached observation for a position loaded from disk whose
/// recon entries are stale: anything observed before this boot is aged out
/// by the freshness gates automatically, so nothing to do beyond logging.
pub fn log_boot_state(pos: &Position) {
    info!(
        trade_key = %pos.trade_key,
        status = %pos.status,
        tp1_done = pos.tp1_done,
        tp2_done = pos.tp2_done,
        trail_active = pos.trail_active,
        be_pending = pos.tp1_be_pending,
        "position restored from state file"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshots::tests::live_order;
    use rust_decimal_macros::dec;

    #[test]
    fn empty_statuses_never_mean_empty_exchange() {
        assert!(!exchange_empty(&[], &[], &[]));
    }

    #[test]
    fn all_terminal_and_no_orders_is_empty() {
        let statuses = vec![
            (OrderKey::Entry, OrderStatus::Filled),
            (OrderKey::Sl, OrderStatus::Canceled),
            (OrderKey::Tp1, OrderStatus::Missing),
            (OrderKey::Tp2, OrderStatus::Expired),
        ];
        assert!(exchange_empty(&statuses, &[], &[]));
    }

    #[test]
    fn live_tracked_order_keeps_position() {
        let statuses = vec![
            (OrderKey::Entry, OrderStatus::Filled),
            (OrderKey::Sl, OrderStatus::New),
        ];
        assert!(!exchange_empty(&statuses, &[], &[]));
    }

    #[test]
    fn foreign_open_order_keeps_position() {
        // Any open order on the symbol blocks the manual-close conclusion.
        let statuses = vec![(OrderKey::Sl, OrderStatus::Canceled)];
        let orders = vec![live_order(99, OrderStatus::New)];
        assert!(!exchange_empty(&statuses, &orders, &[]));
    }

    #[test]
    fn outstanding_debt_keeps_position() {
        let statuses = vec![(OrderKey::Sl, OrderStatus::Canceled)];
        let debts = vec![DebtEntry {
            asset: "USDT".into(),
            borrowed: dec!(95.285),
            interest: dec!(0),
        }];
        assert!(!exchange_empty(&statuses, &[], &debts));
    }

    #[test]
    fn zero_amount_debt_rows_are_ignored() {
        let statuses = vec![(OrderKey::Sl, OrderStatus::Canceled)];
        let debts = vec![DebtEntry {
            asset: "USDT".into(),
            borrowed: dec!(0),
            interest: dec!(0),
        }];
        assert!(exchange_empty(&statuses, &[], &debts));
    }
}
