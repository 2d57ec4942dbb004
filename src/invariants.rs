// =============================================================================
// Anomaly detectors — thirteen read-only invariants with throttled alerting
// =============================================================================
//
// Detectors observe; they never mutate position state and never place or
// cancel orders. Each alert is throttled by (invariant id, position key) so
// a persistent condition pages the operator once per throttle window, not
// once per tick. Throttle timestamps live in a sidecar metadata file so they
// never pollute the trading state document.
//
// All detector I/O failures are swallowed: a detector must not amplify an
// outage into more noise.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::DateTime;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::binance::client::{BinanceClient, DebtEntry};
use crate::binance::rate_limit::RateLimitTracker;
use crate::config::Config;
use crate::events::EventLog;
use crate::snapshots::OpenOrdersSnapshot;
use crate::state_store::BotState;
use crate::types::{PositionStatus, TradeMode};

/// Bar feed staleness threshold for I6 (seconds).
const FEED_STALE_SEC: u64 = 300;
/// Rate-limit error window and count threshold for I10.
const I10_WINDOW_SEC: u64 = 300;
const I10_THRESHOLD: usize = 5;
/// Clock-anomaly horizon for I8 (seconds).
const I8_HORIZON_SEC: u64 = 86_400;

/// One triggered invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantAlert {
    pub id: &'static str,
    pub level: &'static str,
    pub key: String,
    pub message: String,
}

impl InvariantAlert {
    fn warn(id: &'static str, key: &str, message: String) -> Self {
        Self {
            id,
            level: "WARN",
            key: key.to_string(),
            message,
        }
    }

    fn err(id: &'static str, key: &str, message: String) -> Self {
        Self {
            id,
            level: "ERROR",
            key: key.to_string(),
            message,
        }
    }
}

/// Pure inputs for one detector pass. Pre-fetched so the check functions
/// stay synchronous and testable.
pub struct DetectorCtx<'a> {
    pub cfg: &'a Config,
    pub state: &'a BotState,
    pub open_orders: &'a OpenOrdersSnapshot,
    pub rate_limits: &'a RateLimitTracker,
    /// Age of the newest bar in the trailing feed, if readable.
    pub feed_age_s: Option<u64>,
    /// Margin debt snapshot, when one was taken this pass.
    pub debt: Option<&'a [DebtEntry]>,
    pub now_s: u64,
}

/// Evaluate I1–I13 and return every violated invariant (unthrottled).
pub fn collect_alerts(ctx: &DetectorCtx<'_>) -> Vec<InvariantAlert> {
    let mut alerts = Vec::new();
    let cfg = ctx.cfg;
    let pos_key = ctx
        .state
        .position
        .as_ref()
        .map(|p| p.trade_key.clone())
        .unwrap_or_else(|| "none".to_string());

    if let Some(pos) = &ctx.state.position {
        let armed = pos.status == PositionStatus::OpenFilled;
        let age_s = parse_iso_epoch(&pos.opened_at)
            .map(|t| ctx.now_s.saturating_sub(t))
            .unwrap_or(u64::MAX);
        let past_grace = age_s >= cfg.invar_grace_sec;

        // I1: protection present once armed.
        if armed && past_grace && !pos.sl_done && pos.sl_id.is_none() && !pos.halted {
            alerts.push(InvariantAlert::err(
                "I1",
                &pos_key,
                "position is OPEN_FILLED without a stop-loss order".into(),
            ));
        }
        // I1 (soft): the tracked stop should be visible on the venue.
        if armed && past_grace && !pos.sl_done && !pos.tp1_be_pending {
            if let Some(sl_id) = pos.sl_id {
                if ctx.open_orders.is_fresh(ctx.now_s, cfg.invar_grace_sec)
                    && !ctx.open_orders.contains_order(sl_id)
                {
                    alerts.push(InvariantAlert::warn(
                        "I1",
                        &pos_key,
                        format!("stop order {sl_id} not visible in the open-orders snapshot"),
                    ));
                }
            }
        }

        // I2: price hierarchy.
        if !pos.prices_coherent() {
            alerts.push(InvariantAlert::err(
                "I2",
                &pos_key,
                format!(
                    "price hierarchy violated: sl={} entry={} tp1={} tp2={} side={}",
                    pos.sl, pos.entry, pos.tp1, pos.tp2, pos.side
                ),
            ));
        }

        // I3: leg quantities sum to total.
        if armed && pos.qty1 + pos.qty2 + pos.qty3 != pos.qty_total {
            alerts.push(InvariantAlert::err(
                "I3",
                &pos_key,
                format!(
                    "leg quantities {} + {} + {} != total {}",
                    pos.qty1, pos.qty2, pos.qty3, pos.qty_total
                ),
            ));
        }

        // I4: one exchange order id tracked under two slots.
        let ids: Vec<u64> = [pos.entry_id, pos.sl_id, pos.tp1_id, pos.tp2_id, pos.sl_prev_id]
            .iter()
            .flatten()
            .copied()
            .collect();
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        if deduped.len() != ids.len() {
            alerts.push(InvariantAlert::err(
                "I4",
                &pos_key,
                format!("duplicate order id across tracked slots: {ids:?}"),
            ));
        }

        // I5: trailing requires a live stop.
        if pos.trail_active && past_grace && pos.sl_id.is_none() && !pos.sl_done {
            alerts.push(InvariantAlert::err(
                "I5",
                &pos_key,
                "trailing active without a stop order".into(),
            ));
        }

        // I6: trailing feed freshness.
        if pos.trail_active {
            match ctx.feed_age_s {
                Some(age) if age > FEED_STALE_SEC => {
                    alerts.push(InvariantAlert::warn(
                        "I6",
                        &pos_key,
                        format!("trailing feed is {age}s stale (limit {FEED_STALE_SEC}s)"),
                    ));
                }
                None => {
                    alerts.push(InvariantAlert::warn(
                        "I6",
                        &pos_key,
                        "trailing active but the bar feed is unreadable".into(),
                    ));
                }
                _ => {}
            }
        }

        // I7: TP orders exist while their leg is still open.
        if armed && past_grace && !pos.halted {
            if !pos.tp1_done && pos.tp1_id.is_none() {
                alerts.push(InvariantAlert::warn(
                    "I7",
                    &pos_key,
                    "TP1 leg open but no TP1 order tracked".into(),
                ));
            }
            if !pos.tp2_done && !pos.trail_active && pos.tp2_id.is_none() {
                alerts.push(InvariantAlert::warn(
                    "I7",
                    &pos_key,
                    "TP2 leg open but no TP2 order tracked".into(),
                ));
            }
        }

        // I9: trailing update timestamps advance.
        if pos.trail_active
            && pos.last_trail_update_s > 0
            && ctx.now_s.saturating_sub(pos.last_trail_update_s)
                > cfg.trail_update_every_sec * 3
        {
            alerts.push(InvariantAlert::warn(
                "I9",
                &pos_key,
                format!(
                    "trailing has not updated for {}s",
                    ctx.now_s.saturating_sub(pos.last_trail_update_s)
                ),
            ));
        }
    }

    // I8: deadline sanity (clock anomaly).
    if ctx.state.cooldown_until_s > ctx.now_s + I8_HORIZON_SEC
        || ctx.state.lock_until_s > ctx.now_s + I8_HORIZON_SEC
    {
        alerts.push(InvariantAlert::warn(
            "I8",
            &pos_key,
            format!(
                "deadline beyond sanity horizon: cooldown={} lock={} now={}",
                ctx.state.cooldown_until_s, ctx.state.lock_until_s, ctx.now_s
            ),
        ));
    }

    // I10: repeated rate-limit-like errors.
    let (errors, top_endpoint) = ctx.rate_limits.recent_errors(ctx.now_s, I10_WINDOW_SEC);
    if errors >= I10_THRESHOLD {
        alerts.push(InvariantAlert::warn(
            "I10",
            &pos_key,
            format!(
                "{errors} rate-limit errors in {I10_WINDOW_SEC}s (worst endpoint: {})",
                top_endpoint.unwrap_or_else(|| "unknown".into())
            ),
        ));
    }

    // I11: margin-mode coherence.
    if cfg.trade_mode == TradeMode::Spot && ctx.state.margin.active_trade_key.is_some() {
        alerts.push(InvariantAlert::err(
            "I11",
            &pos_key,
            "spot mode but the margin ledger has an active borrow".into(),
        ));
    }

    // I12: seen-key bound respected.
    if ctx.state.seen_keys.len() > cfg.seen_keys_max {
        alerts.push(InvariantAlert::warn(
            "I12",
            &pos_key,
            format!(
                "seen-key set size {} exceeds bound {}",
                ctx.state.seen_keys.len(),
                cfg.seen_keys_max
            ),
        ));
    }

    // I13: post-close debt must drain to zero.
    if ctx.state.position.is_none() {
        if let (Some(last), Some(debt)) = (&ctx.state.last_closed, ctx.debt) {
            let elapsed = ctx.now_s.saturating_sub(last.closed_at_s);
            if !debt.is_empty() && elapsed >= cfg.i13_grace_sec {
                let assets: Vec<String> = debt
                    .iter()
                    .map(|d| format!("{}={}", d.asset, d.total()))
                    .collect();
                let msg = format!(
                    "debt outstanding {}s after close: {}",
                    elapsed,
                    assets.join(", ")
                );
                if elapsed >= cfg.i13_escalate_sec {
                    alerts.push(InvariantAlert::err("I13", &last.trade_key, msg));
                } else {
                    alerts.push(InvariantAlert::warn("I13", &last.trade_key, msg));
                }
            }
        }
    }

    alerts
}

fn parse_iso_epoch(ts: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.timestamp().max(0) as u64)
}

// -----------------------------------------------------------------------------
// Driver with throttle metadata
// -----------------------------------------------------------------------------

/// Stateful detector driver: throttling, sidecar metadata persistence, and
/// the I13 kill decision.
pub struct Detectors {
    meta_path: PathBuf,
    /// "{invariant}|{key}" → next allowed alert time.
    throttle: HashMap<String, u64>,
    last_run_s: u64,
    last_debt_check_s: u64,
}

impl Detectors {
    pub fn new(meta_path: impl Into<PathBuf>) -> Self {
        let meta_path = meta_path.into();
        let throttle = std::fs::read_to_string(&meta_path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default();
        Self {
            meta_path,
            throttle,
            last_run_s: 0,
            last_debt_check_s: 0,
        }
    }

    /// Run one detector pass if due. Returns `true` when I13 escalated to
    /// ERROR and `I13_KILL_ON_DEBT` demands a halt.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &mut self,
        cfg: &Config,
        state: &BotState,
        open_orders: &OpenOrdersSnapshot,
        rate_limits: &RateLimitTracker,
        client: &BinanceClient,
        events: &EventLog,
        now_s: u64,
    ) -> bool {
        if !cfg.invar_enabled || now_s.saturating_sub(self.last_run_s) < cfg.invar_every_sec {
            return false;
        }
        self.last_run_s = now_s;

        // Feed age, best effort.
        let feed_age_s = feed_age(cfg, now_s);

        // I13 debt snapshot: only after a close, only on margin accounts,
        // and throttled like any other expensive read.
        let mut debt: Option<Vec<DebtEntry>> = None;
        if cfg.trade_mode == TradeMode::Margin
            && state.position.is_none()
            && state.last_closed.is_some()
            && now_s.saturating_sub(self.last_debt_check_s) >= cfg.invar_every_sec
        {
            self.last_debt_check_s = now_s;
            match client.margin_debt(&cfg.symbol).await {
                Ok(d) => debt = Some(d),
                Err(e) => debug!(error = %e, "I13 debt snapshot failed — skipping this pass"),
            }
        }

        let ctx = DetectorCtx {
            cfg,
            state,
            open_orders,
            rate_limits,
            feed_age_s,
            debt: debt.as_deref(),
            now_s,
        };
        let alerts = collect_alerts(&ctx);

        let mut kill = false;
        let mut throttle_dirty = false;
        for alert in &alerts {
            let throttle_key = format!("{}|{}", alert.id, alert.key);
            let next_ok = self.throttle.get(&throttle_key).copied().unwrap_or(0);
            if now_s < next_ok {
                continue;
            }
            self.throttle
                .insert(throttle_key, now_s + cfg.invar_throttle_sec);
            throttle_dirty = true;

            match alert.level {
                "ERROR" => error!(id = alert.id, key = %alert.key, "{}", alert.message),
                _ => warn!(id = alert.id, key = %alert.key, "{}", alert.message),
            }
            events.emit(
                "INVARIANT_VIOLATION",
                json!({
                    "invariant": alert.id,
                    "level": alert.level,
                    "key": alert.key,
                    "message": alert.message,
                }),
            );

            if alert.id == "I13" && alert.level == "ERROR" && cfg.i13_kill_on_debt {
                kill = true;
            }
        }

        if throttle_dirty {
            self.persist_meta();
        }
        kill
    }

    fn persist_meta(&self) {
        let res = serde_json::to_string(&self.throttle)
            .map_err(std::io::Error::other)
            .and_then(|content| std::fs::write(&self.meta_path, content));
        if let Err(e) = res {
            debug!(error = %e, "failed to persist detector metadata");
        }
    }
}

/// Age of the newest bar in the trailing feed. Any read problem is `None` —
/// detectors never propagate I/O errors.
fn feed_age(cfg: &Config, now_s: u64) -> Option<u64> {
    let ts = crate::trail::TrailEngine::new(
        cfg.bars_csv_path.clone(),
        cfg.trail_swing_lookback,
        cfg.trail_swing_lr,
        cfg.trail_swing_buffer_usd,
        cfg.trail_confirm_buffer_usd,
    )
    .latest_bar_ts()
    .ok()??;
    parse_iso_epoch(&ts).map(|t| now_s.saturating_sub(t))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base_config;
    use crate::position::tests::sample_position;
    use rust_decimal_macros::dec;

    fn ctx_with<'a>(
        cfg: &'a Config,
        state: &'a BotState,
        orders: &'a OpenOrdersSnapshot,
        limits: &'a RateLimitTracker,
    ) -> DetectorCtx<'a> {
        DetectorCtx {
            cfg,
            state,
            open_orders: orders,
            rate_limits: limits,
            feed_age_s: Some(10),
            debt: None,
            // Position opened_at is 2025-01-13T20:00:00Z; run well past it.
            now_s: 1_736_800_000,
        }
    }

    fn armed_state() -> BotState {
        let mut st = BotState::default();
        st.position = Some(sample_position());
        st
    }

    #[test]
    fn healthy_position_raises_nothing() {
        let cfg = base_config();
        let state = armed_state();
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.is_empty(), "unexpected alerts: {alerts:?}");
    }

    #[test]
    fn i1_missing_stop_on_armed_position() {
        let cfg = base_config();
        let mut state = armed_state();
        state.position.as_mut().unwrap().sl_id = None;
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I1" && a.level == "ERROR"));
    }

    #[test]
    fn i2_price_hierarchy_violation() {
        let cfg = base_config();
        let mut state = armed_state();
        state.position.as_mut().unwrap().sl = dec!(96000);
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I2"));
    }

    #[test]
    fn i3_leg_sum_violation() {
        let cfg = base_config();
        let mut state = armed_state();
        state.position.as_mut().unwrap().qty3 = dec!(0.00001);
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I3"));
    }

    #[test]
    fn i4_duplicate_order_id() {
        let cfg = base_config();
        let mut state = armed_state();
        state.position.as_mut().unwrap().sl_prev_id = Some(2); // same as sl_id
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I4"));
    }

    #[test]
    fn i5_trailing_without_stop() {
        let cfg = base_config();
        let mut state = armed_state();
        {
            let pos = state.position.as_mut().unwrap();
            pos.trail_active = true;
            pos.sl_id = None;
        }
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I5"));
        // I1 fires too — both watch the stop from different angles.
        assert!(alerts.iter().any(|a| a.id == "I1"));
    }

    #[test]
    fn i6_stale_feed_only_when_trailing() {
        let cfg = base_config();
        let mut state = armed_state();
        state.position.as_mut().unwrap().trail_active = true;
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();

        let mut ctx = ctx_with(&cfg, &state, &orders, &limits);
        ctx.feed_age_s = Some(FEED_STALE_SEC + 60);
        let alerts = collect_alerts(&ctx);
        assert!(alerts.iter().any(|a| a.id == "I6"));

        // Same staleness without trailing: silent.
        state.position.as_mut().unwrap().trail_active = false;
        let mut ctx = ctx_with(&cfg, &state, &orders, &limits);
        ctx.feed_age_s = Some(FEED_STALE_SEC + 60);
        let alerts = collect_alerts(&ctx);
        assert!(!alerts.iter().any(|a| a.id == "I6"));
    }

    #[test]
    fn i7_missing_tp_orders() {
        let cfg = base_config();
        let mut state = armed_state();
        state.position.as_mut().unwrap().tp1_id = None;
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I7"));
    }

    #[test]
    fn i10_rate_limit_burst() {
        let cfg = base_config();
        let state = BotState::default();
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let now = 1_736_800_000u64;
        for _ in 0..I10_THRESHOLD {
            limits.record_rate_limit_error("/api/v3/order", now - 10);
        }
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I10"));
    }

    #[test]
    fn i11_spot_with_active_borrow() {
        let cfg = base_config();
        let mut state = BotState::default();
        state.margin.active_trade_key = Some("tk-old".into());
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let alerts = collect_alerts(&ctx_with(&cfg, &state, &orders, &limits));
        assert!(alerts.iter().any(|a| a.id == "I11" && a.level == "ERROR"));
    }

    #[test]
    fn i13_escalates_warn_to_error() {
        let cfg = base_config();
        let mut state = BotState::default();
        let now = 1_736_800_000u64;
        state.last_closed = Some(crate::position::LastClosed {
            trade_key: "tk-done".into(),
            side: crate::types::Side::Long,
            entry: dec!(95000),
            qty_total: dec!(0.001),
            tp1_done: true,
            tp2_done: true,
            trail_active: false,
            reason: "SL_FILLED".into(),
            closed_at: "2025-01-13T21:00:00Z".into(),
            closed_at_s: now - cfg.i13_grace_sec - 1,
        });
        let debt = vec![DebtEntry {
            asset: "USDT".into(),
            borrowed: dec!(95.285),
            interest: dec!(0.001),
        }];
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();

        // Past grace, before escalation: WARN.
        let mut ctx = ctx_with(&cfg, &state, &orders, &limits);
        ctx.debt = Some(&debt);
        ctx.now_s = now;
        let alerts = collect_alerts(&ctx);
        let i13 = alerts.iter().find(|a| a.id == "I13").unwrap();
        assert_eq!(i13.level, "WARN");

        // Past escalation: ERROR.
        state.last_closed.as_mut().unwrap().closed_at_s = now - cfg.i13_escalate_sec - 1;
        let mut ctx = ctx_with(&cfg, &state, &orders, &limits);
        ctx.debt = Some(&debt);
        ctx.now_s = now;
        let alerts = collect_alerts(&ctx);
        let i13 = alerts.iter().find(|a| a.id == "I13").unwrap();
        assert_eq!(i13.level, "ERROR");
    }

    #[test]
    fn i13_silent_with_no_debt() {
        let cfg = base_config();
        let mut state = BotState::default();
        let now = 1_736_800_000u64;
        state.last_closed = Some(crate::position::LastClosed {
            trade_key: "tk-done".into(),
            side: crate::types::Side::Long,
            entry: dec!(95000),
            qty_total: dec!(0.001),
            tp1_done: false,
            tp2_done: false,
            trail_active: false,
            reason: "SL_FILLED".into(),
            closed_at: "2025-01-13T21:00:00Z".into(),
            closed_at_s: now - 10_000,
        });
        let debt: Vec<DebtEntry> = Vec::new();
        let orders = OpenOrdersSnapshot::new(5);
        let limits = RateLimitTracker::new();
        let mut ctx = ctx_with(&cfg, &state, &orders, &limits);
        ctx.debt = Some(&debt);
        ctx.now_s = now;
        let alerts = collect_alerts(&ctx);
        assert!(!alerts.iter().any(|a| a.id == "I13"));
    }
}
