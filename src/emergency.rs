// =============================================================================
// Emergency shutdown — operator-controlled filesystem flags and sleep mode
// =============================================================================
//
// Two flags rule the engine from outside:
//   emergency_shutdown.flag — run a reconciliation-first shutdown, then sleep
//                             (ignore all new signals).
//   wake_up.flag            — leave sleep mode and resume normal processing.
//
// The shutdown path is deliberately conservative: poll every tracked order,
// cancel what still lives, and only clear the position once the venue shows
// everything terminal. A failed primary state save falls back to the backup
// side file — the process reports and cooperates, it does not halt.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::binance::client::BinanceClient;
use crate::config::Config;
use crate::events::EventLog;
use crate::margin;
use crate::position::LastClosed;
use crate::state_store::{BotState, StateStore};
use crate::types::OrderKey;

pub fn emergency_flag_present(cfg: &Config) -> bool {
    std::path::Path::new(&cfg.emergency_flag_path).exists()
}

pub fn wake_flag_present(cfg: &Config) -> bool {
    std::path::Path::new(&cfg.wake_flag_path).exists()
}

/// Remove both flags when waking up; removal failures only warn (the files
/// are operator-owned).
pub fn consume_flags(cfg: &Config) {
    for path in [&cfg.wake_flag_path, &cfg.emergency_flag_path] {
        if std::path::Path::new(path).exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path, error = %e, "failed to remove operator flag");
            }
        }
    }
}

/// Run the reconciliation-first emergency shutdown.
///
/// Returns `true` when the engine entered sleep mode (it always does once
/// this completes; the position may or may not have been cleared).
pub async fn run_shutdown(
    cfg: &Config,
    client: &BinanceClient,
    state: &mut BotState,
    store: &mut StateStore,
    events: &EventLog,
    now_s: u64,
) -> Result<bool> {
    events.emit("EMERGENCY_SHUTDOWN_START", json!({}));
    info!("emergency shutdown flag detected — reconciling before sleep");

    let mut cleared = false;
    if let Some(pos) = state.position.as_mut() {
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

        // First pass: poll everything; cancel whatever still lives.
        for (key, order_id) in &tracked {
            match client.order_status(&cfg.symbol, *order_id).await {
                Ok(info) if info.status.is_live() => {
                    info!(order_id, key = %key, "cancelling live order for shutdown");
                    if let Err(e) = client.cancel(&cfg.symbol, *order_id).await {
                        warn!(order_id, error = %e, "shutdown cancel failed");
                    }
                }
                Ok(info) => {
                    pos.observe(*key, info.status, now_s);
                }
                Err(e) => warn!(order_id, error = %e, "shutdown status poll failed"),
            }
        }

        // Second pass: require every tracked order terminal before clearing.
        let mut all_terminal = true;
        for (key, order_id) in &tracked {
            match client.order_status(&cfg.symbol, *order_id).await {
                Ok(info) => {
                    pos.observe(*key, info.status, now_s);
                    if !info.status.is_terminal() {
                        all_terminal = false;
                    }
                }
                Err(_) => all_terminal = false,
            }
        }

        if all_terminal {
            let trade_key = pos.trade_key.clone();
            let last = LastClosed {
                trade_key: trade_key.clone(),
                side: pos.side,
                entry: pos.entry,
                qty_total: pos.qty_total,
                tp1_done: pos.tp1_done,
                tp2_done: pos.tp2_done,
                trail_active: pos.trail_active,
                reason: "EMERGENCY_SHUTDOWN".into(),
                closed_at: Utc::now().to_rfc3339(),
                closed_at_s: now_s,
            };

            if let Err(e) =
                margin::after_close(cfg, client, &mut state.margin, &trade_key).await
            {
                warn!(error = %e, "margin repay during shutdown failed — operator must settle");
            }

            state.last_closed = Some(last);
            state.position = None;
            state.cooldown_until_s = now_s + cfg.cooldown_sec;
            cleared = true;
            events.emit("EMERGENCY_POSITION_CLEARED", json!({ "trade_key": trade_key }));
        } else {
            warn!("tracked orders still live after shutdown pass — sleeping with position kept");
        }
    }

    state.sleeping = true;
    if !store.save(state) {
        // The primary save failing is exactly the situation the backup
        // exists for.
        store.save_backup(state);
    }

    events.emit(
        "EMERGENCY_SHUTDOWN_DONE",
        json!({ "position_cleared": cleared }),
    );
    info!("engine is asleep — create the wake flag to resume");
    Ok(true)
}
