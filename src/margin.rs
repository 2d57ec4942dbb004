// =============================================================================
// Margin coordinator — per-trade borrow/repay life-cycle
// =============================================================================
//
// Two modes, never mixed (refused at config validation):
//   auto   — the exchange manages borrow/repay via order side effects; every
//            hook here is a no-op and orders carry MARGIN_BUY / AUTO_REPAY.
//   manual — the coordinator borrows before entry and repays after close;
//            orders carry NO_SIDE_EFFECT.
//
// Borrow sizing uses the step-rounded price and quantity — the exact values
// that go on the wire — plus a small buffer for fees. Sizing from pre-format
// values under-borrows: the rounded notional can exceed the borrow and the
// venue rejects the order with "insufficient balance".
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binance::client::BinanceClient;
use crate::config::Config;
use crate::types::{BorrowMode, Side, TradeMode};

/// Persistent borrow bookkeeping, embedded in the state document.
///
/// Every key in `borrowed` must appear in `repaid` by the time its position
/// reaches CLOSED — the no-debt invariant (I13) checks the exchange side of
/// the same contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginLedger {
    /// trade_key → asset → borrowed amount.
    #[serde(default)]
    pub borrowed: BTreeMap<String, BTreeMap<String, Decimal>>,
    /// Trade keys whose borrow has been fully repaid.
    #[serde(default)]
    pub repaid: Vec<String>,
    /// The trade key currently holding a borrow, if any.
    #[serde(default)]
    pub active_trade_key: Option<String>,
}

impl MarginLedger {
    pub fn record_borrow(&mut self, trade_key: &str, asset: &str, amount: Decimal) {
        *self
            .borrowed
            .entry(trade_key.to_string())
            .or_default()
            .entry(asset.to_string())
            .or_insert(Decimal::ZERO) += amount;
    }

    pub fn mark_repaid(&mut self, trade_key: &str) {
        // Keys that never borrowed have nothing to settle.
        if self.borrowed.contains_key(trade_key) && !self.repaid.iter().any(|k| k == trade_key) {
            self.repaid.push(trade_key.to_string());
        }
        if self.active_trade_key.as_deref() == Some(trade_key) {
            self.active_trade_key = None;
        }
    }

    /// True when `trade_key` borrowed and has not been repaid yet.
    pub fn outstanding(&self, trade_key: &str) -> bool {
        self.borrowed.contains_key(trade_key) && !self.repaid.iter().any(|k| k == trade_key)
    }
}

/// Side-effect flag for the entry order under the configured mode.
pub fn entry_side_effect(cfg: &Config) -> Option<&'static str> {
    match (cfg.trade_mode, cfg.margin_borrow_mode) {
        (TradeMode::Spot, _) => None,
        (TradeMode::Margin, BorrowMode::Auto) => Some("MARGIN_BUY"),
        (TradeMode::Margin, BorrowMode::Manual) => Some("NO_SIDE_EFFECT"),
    }
}

/// Side-effect flag for reducing orders (exits, flattens, rebalances).
pub fn exit_side_effect(cfg: &Config) -> Option<&'static str> {
    match (cfg.trade_mode, cfg.margin_borrow_mode) {
        (TradeMode::Spot, _) => None,
        (TradeMode::Margin, BorrowMode::Auto) => Some("AUTO_REPAY"),
        (TradeMode::Margin, BorrowMode::Manual) => Some("NO_SIDE_EFFECT"),
    }
}

/// Amount to borrow for one entry: the asset and size, or `None` when the
/// mode needs no explicit borrow.
///
/// LONG borrows the quote asset for the full (formatted) notional; SHORT
/// borrows the base asset for the (formatted) quantity. The buffer absorbs
/// fees and rounding on the venue side.
pub fn borrow_requirement(
    cfg: &Config,
    side: Side,
    formatted_qty: Decimal,
    formatted_price: Decimal,
) -> Option<(String, Decimal)> {
    if cfg.trade_mode != TradeMode::Margin || cfg.margin_borrow_mode != BorrowMode::Manual {
        return None;
    }
    let buffer = Decimal::ONE + cfg.margin_borrow_buffer_pct / Decimal::ONE_HUNDRED;
    match side {
        Side::Long => {
            let notional = formatted_qty * formatted_price * buffer;
            Some((cfg.quote_asset.clone(), notional.round_dp(8)))
        }
        Side::Short => {
            let qty = formatted_qty * buffer;
            Some((cfg.base_asset.clone(), qty.round_dp(8)))
        }
    }
}

// -----------------------------------------------------------------------------
// Life-cycle hooks, called from the tick
// -----------------------------------------------------------------------------

/// Startup hook: verify the margin account is reachable in manual mode.
pub async fn on_startup(cfg: &Config, client: &BinanceClient) -> Result<()> {
    if cfg.trade_mode == TradeMode::Margin && cfg.margin_borrow_mode == BorrowMode::Manual {
        let debts = client
            .margin_debt(&cfg.symbol)
            .await
            .context("margin startup check failed")?;
        if !debts.is_empty() {
            warn!(
                count = debts.len(),
                "margin account carries pre-existing debt at startup"
            );
        }
        info!("margin coordinator ready (manual borrow mode)");
    }
    Ok(())
}

/// Pre-entry hook: ensure the borrow backing the entry order exists.
pub async fn before_entry(
    cfg: &Config,
    client: &BinanceClient,
    ledger: &mut MarginLedger,
    trade_key: &str,
    side: Side,
    formatted_qty: Decimal,
    formatted_price: Decimal,
) -> Result<()> {
    let Some((asset, amount)) = borrow_requirement(cfg, side, formatted_qty, formatted_price)
    else {
        return Ok(());
    };

    client
        .margin_borrow(&cfg.symbol, &asset, amount)
        .await
        .with_context(|| format!("borrow of {amount} {asset} for {trade_key} failed"))?;
    ledger.record_borrow(trade_key, &asset, amount);
    info!(trade_key, asset = %asset, amount = %amount, "margin borrowed for entry");
    Ok(())
}

/// Post-entry hook: mark the trade as the one holding the borrow. A trade
/// that borrowed nothing (spot, or exchange-managed side effects) holds no
/// slot.
pub fn after_entry_open(ledger: &mut MarginLedger, trade_key: &str) {
    if ledger.borrowed.contains_key(trade_key) {
        ledger.active_trade_key = Some(trade_key.to_string());
    }
}

/// Post-close hook: repay whatever the trade still owes. Repayment is
/// bounded by the live debt snapshot so a partial exchange-side auto-repay
/// never makes us over-repay.
pub async fn after_close(
    cfg: &Config,
    client: &BinanceClient,
    ledger: &mut MarginLedger,
    trade_key: &str,
) -> Result<()> {
    if cfg.trade_mode != TradeMode::Margin || cfg.margin_borrow_mode != BorrowMode::Manual {
        ledger.mark_repaid(trade_key);
        return Ok(());
    }
    if !ledger.outstanding(trade_key) {
        ledger.mark_repaid(trade_key);
        return Ok(());
    }

    let debts = client
        .margin_debt(&cfg.symbol)
        .await
        .context("debt snapshot before repay failed")?;

    let recorded = ledger.borrowed.get(trade_key).cloned().unwrap_or_default();
    for (asset, amount) in &recorded {
        let outstanding = debts
            .iter()
            .find(|d| &d.asset == asset)
            .map(|d| d.total())
            .unwrap_or(Decimal::ZERO);
        let repay = (*amount).min(outstanding);
        if repay <= Decimal::ZERO {
            debug!(asset = %asset, "nothing left to repay");
            continue;
        }
        client
            .margin_repay(&cfg.symbol, asset, repay)
            .await
            .with_context(|| format!("repay of {repay} {asset} for {trade_key} failed"))?;
        info!(trade_key, asset = %asset, amount = %repay, "margin repaid after close");
    }

    ledger.mark_repaid(trade_key);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn margin_cfg() -> Config {
        let mut cfg = crate::config::tests::base_config();
        cfg.trade_mode = TradeMode::Margin;
        cfg.margin_borrow_mode = BorrowMode::Manual;
        cfg
    }

    #[test]
    fn spot_needs_no_borrow_and_no_side_effect() {
        let cfg = crate::config::tests::base_config();
        assert_eq!(entry_side_effect(&cfg), None);
        assert_eq!(exit_side_effect(&cfg), None);
        assert!(borrow_requirement(&cfg, Side::Long, dec!(0.001), dec!(95000)).is_none());
    }

    #[test]
    fn auto_mode_uses_exchange_side_effects() {
        let mut cfg = margin_cfg();
        cfg.margin_borrow_mode = BorrowMode::Auto;
        assert_eq!(entry_side_effect(&cfg), Some("MARGIN_BUY"));
        assert_eq!(exit_side_effect(&cfg), Some("AUTO_REPAY"));
        assert!(borrow_requirement(&cfg, Side::Long, dec!(0.001), dec!(95000)).is_none());
    }

    #[test]
    fn manual_long_borrows_buffered_quote_notional() {
        let cfg = margin_cfg();
        let (asset, amount) =
            borrow_requirement(&cfg, Side::Long, dec!(0.001), dec!(95000)).unwrap();
        assert_eq!(asset, "USDT");
        // 0.001 * 95000 = 95, +0.3% = 95.285
        assert_eq!(amount, dec!(95.285));
    }

    #[test]
    fn manual_short_borrows_buffered_base_qty() {
        let cfg = margin_cfg();
        let (asset, amount) =
            borrow_requirement(&cfg, Side::Short, dec!(0.001), dec!(95000)).unwrap();
        assert_eq!(asset, "BTC");
        assert_eq!(amount, dec!(0.001003));
    }

    #[test]
    fn ledger_tracks_outstanding_until_repaid() {
        let mut ledger = MarginLedger::default();
        ledger.record_borrow("tk-1", "USDT", dec!(95.285));
        assert!(ledger.outstanding("tk-1"));

        ledger.mark_repaid("tk-1");
        assert!(!ledger.outstanding("tk-1"));
        assert!(ledger.repaid.iter().any(|k| k == "tk-1"));

        // Marking twice does not duplicate.
        ledger.mark_repaid("tk-1");
        assert_eq!(ledger.repaid.iter().filter(|k| *k == "tk-1").count(), 1);
    }

    #[test]
    fn repeated_borrows_accumulate() {
        let mut ledger = MarginLedger::default();
        ledger.record_borrow("tk-1", "USDT", dec!(50));
        ledger.record_borrow("tk-1", "USDT", dec!(25));
        assert_eq!(ledger.borrowed["tk-1"]["USDT"], dec!(75));
    }
}
