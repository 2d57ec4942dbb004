// =============================================================================
// Borealis Peak Executor — Main Entry Point
// =============================================================================
//
// One process, one symbol, at most one open position. The engine boots by
// reconciling persisted state against the exchange, then runs a single
// sequential tick loop: no other task ever writes trading state.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod config;
mod dedup;
mod emergency;
mod entry;
mod events;
mod exits;
mod invariants;
mod margin;
mod planner;
mod position;
mod reconcile;
mod snapshots;
mod state_store;
mod steps;
mod tail;
mod tick;
mod trail;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::client::BinanceClient;
use crate::binance::rate_limit::RateLimitTracker;
use crate::config::Config;
use crate::events::{EventLog, Webhook};
use crate::invariants::Detectors;
use crate::state_store::StateStore;
use crate::tick::{Engine, TickOutcome};
use crate::trail::TrailEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Peak Executor — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cfg = Config::from_env()?;

    // ── 2. Build components ──────────────────────────────────────────────
    let rate_limits = Arc::new(RateLimitTracker::new());
    let client = BinanceClient::new(&cfg, rate_limits.clone());

    let store = StateStore::new(&cfg.state_path, &cfg.state_backup_path);
    // Malformed state is fatal: silently starting fresh over a corrupt
    // document could duplicate a live position.
    let state = store.load()?;

    let webhook = cfg.webhook_url.as_ref().map(|url| Webhook {
        url: url.clone(),
        user: cfg.webhook_user.clone(),
        pass: cfg.webhook_pass.clone(),
    });
    let events = EventLog::new(
        &cfg.events_log_path,
        &cfg.reports_log_path,
        cfg.log_max_lines,
        webhook,
    );

    let trail = TrailEngine::new(
        cfg.bars_csv_path.clone(),
        cfg.trail_swing_lookback,
        cfg.trail_swing_lr,
        cfg.trail_swing_buffer_usd,
        cfg.trail_confirm_buffer_usd,
    );
    let detectors = Detectors::new(&cfg.invar_meta_path);

    let manage_every = cfg.manage_every_sec;
    let mut engine = Engine::new(
        cfg,
        client,
        state,
        store,
        trail,
        events,
        detectors,
        rate_limits,
    );

    // ── 3. Boot: time sync, dedup bootstrap, margin check, reconcile ─────
    engine.boot().await?;
    engine
        .events
        .emit("STARTUP", serde_json::json!({ "symbol": engine.cfg.symbol }));
    info!(
        symbol = %engine.cfg.symbol,
        manage_every_sec = manage_every,
        "engine attached — entering tick loop"
    );

    // ── 4. The tick loop ─────────────────────────────────────────────────
    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_secs(manage_every.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.tick().await {
                    TickOutcome::Continue => {}
                    TickOutcome::Halt => {
                        error!("engine requested halt — exiting");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received — flushing state");
                break;
            }
        }
    }

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    engine.flush();
    engine.events.emit("SHUTDOWN", serde_json::json!({}));
    info!("Borealis Peak Executor shut down complete.");
    Ok(())
}
