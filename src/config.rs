// =============================================================================
// Configuration — flat key surface loaded from the environment
// =============================================================================
//
// Every tunable lives here as one typed field parsed once at startup.
// `Config::from_env` reads the process environment (with dotenv support from
// main), applies defaults, and validates cross-field invariants before the
// engine touches the exchange.
// =============================================================================

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use tracing::info;

use crate::types::{BorrowMode, EntryMode, PlanBDevRule, TradeMode, TrailSource};

/// Full runtime configuration for the executor.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Instrument -----------------------------------------------------------
    pub symbol: String,
    /// Base asset of the symbol (e.g. "BTC" for BTCUSDT).
    pub base_asset: String,
    /// Quote asset of the symbol (e.g. "USDT").
    pub quote_asset: String,
    pub qty_usd: Decimal,
    pub qty_step: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,

    // --- Exit structure -------------------------------------------------------
    /// Percentage stop distance used when no swing stop is available.
    pub sl_pct: Decimal,
    /// R-multiples for TP1 and TP2.
    pub tp_r_list: Vec<Decimal>,
    /// Lookback window (minutes of bars) for the swing-based entry stop.
    pub swing_mins: usize,

    // --- Entry ----------------------------------------------------------------
    pub entry_offset_usd: Decimal,
    pub entry_mode: EntryMode,
    pub live_entry_timeout_sec: u64,
    pub planb_max_dev_usd: Decimal,
    pub planb_max_dev_r_mult: Decimal,
    pub planb_dev_rule: PlanBDevRule,

    // --- Cadence --------------------------------------------------------------
    pub poll_sec: u64,
    pub cooldown_sec: u64,
    pub lock_sec: u64,
    pub manage_every_sec: u64,
    pub trail_update_every_sec: u64,
    pub exits_retry_every_sec: u64,
    pub failsafe_exits_max_tries: u32,
    pub failsafe_flatten: bool,

    // --- Trailing -------------------------------------------------------------
    pub trail_source: TrailSource,
    pub trail_swing_lookback: usize,
    pub trail_swing_lr: usize,
    pub trail_swing_buffer_usd: Decimal,
    pub trail_confirm_buffer_usd: Decimal,
    pub trail_step_usd: Decimal,

    // --- Margin ---------------------------------------------------------------
    pub trade_mode: TradeMode,
    pub margin_isolated: bool,
    pub margin_borrow_mode: BorrowMode,
    pub margin_borrow_buffer_pct: Decimal,

    // --- Invariant detectors --------------------------------------------------
    pub invar_enabled: bool,
    pub invar_every_sec: u64,
    pub invar_throttle_sec: u64,
    pub invar_grace_sec: u64,
    pub i13_grace_sec: u64,
    pub i13_escalate_sec: u64,
    pub i13_kill_on_debt: bool,

    // --- Watchdogs ------------------------------------------------------------
    pub tp1_be_max_attempts: u32,
    pub tp1_be_cooldown_sec: u64,
    pub sl_recon_fresh_sec: u64,
    pub sl_watchdog_grace_sec: u64,
    pub sl_watchdog_retry_sec: u64,
    pub watchdog_max_attempts: u32,
    pub watchdog_cooldown_sec: u64,
    pub close_cleanup_retry_sec: u64,
    pub snapshot_min_sec: u64,
    pub sync_exchange_throttle_sec: u64,

    // --- Dedup ----------------------------------------------------------------
    pub dedup_price_decimals: u32,
    pub seen_keys_max: usize,
    pub strict_source: bool,

    // --- Logging & signals ----------------------------------------------------
    pub log_max_lines: usize,
    pub tail_lines: usize,
    pub max_peak_age_sec: u64,

    // --- Webhook --------------------------------------------------------------
    pub webhook_url: Option<String>,
    pub webhook_user: String,
    pub webhook_pass: String,

    // --- Paths ----------------------------------------------------------------
    pub signals_path: String,
    pub bars_csv_path: String,
    pub state_path: String,
    pub state_backup_path: String,
    pub events_log_path: String,
    pub reports_log_path: String,
    pub invar_meta_path: String,
    pub emergency_flag_path: String,
    pub wake_flag_path: String,

    // --- Exchange credentials -------------------------------------------------
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
}

// -----------------------------------------------------------------------------
// Env parsing helpers
// -----------------------------------------------------------------------------

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("invalid {key}={other}: expected a boolean"),
        },
        Err(_) => Ok(default),
    }
}

fn env_dec(key: &str, default: &str) -> Result<Decimal> {
    let raw = env_str(key, default);
    Decimal::from_str(raw.trim()).with_context(|| format!("invalid {key}={raw}"))
}

fn env_dec_list(key: &str, default: &str) -> Result<Vec<Decimal>> {
    let raw = env_str(key, default);
    raw.split(',')
        .map(|s| {
            Decimal::from_str(s.trim()).with_context(|| format!("invalid {key} entry '{s}'"))
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Loading & validation
// -----------------------------------------------------------------------------

impl Config {
    /// Load configuration from the environment and validate it.
    pub fn from_env() -> Result<Self> {
        let symbol = env_str("SYMBOL", "BTCUSDT").to_uppercase();
        let quote_asset = env_str("QUOTE_ASSET", "USDT").to_uppercase();
        let base_asset = match std::env::var("BASE_ASSET") {
            Ok(b) => b.to_uppercase(),
            Err(_) => symbol
                .strip_suffix(&quote_asset)
                .unwrap_or(&symbol)
                .to_string(),
        };

        let cfg = Self {
            symbol,
            base_asset,
            quote_asset,
            qty_usd: env_dec("QTY_USD", "100")?,
            qty_step: env_dec("QTY_STEP", "0.00001")?,
            tick_size: env_dec("TICK_SIZE", "0.01")?,
            min_qty: env_dec("MIN_QTY", "0.00001")?,
            min_notional: env_dec("MIN_NOTIONAL", "5")?,

            sl_pct: env_dec("SL_PCT", "0.5")?,
            tp_r_list: env_dec_list("TP_R_LIST", "1.0,2.0")?,
            swing_mins: env_parse("SWING_MINS", 60usize)?,

            entry_offset_usd: env_dec("ENTRY_OFFSET_USD", "0.5")?,
            entry_mode: parse_entry_mode(&env_str("ENTRY_MODE", "LIMIT_THEN_MARKET"))?,
            live_entry_timeout_sec: env_parse("LIVE_ENTRY_TIMEOUT_SEC", 45u64)?,
            planb_max_dev_usd: env_dec("PLANB_MAX_DEV_USD", "150")?,
            planb_max_dev_r_mult: env_dec("PLANB_MAX_DEV_R_MULT", "0.5")?,
            planb_dev_rule: parse_planb_rule(&env_str("PLANB_DEV_RULE", "either"))?,

            poll_sec: env_parse("POLL_SEC", 5u64)?,
            cooldown_sec: env_parse("COOLDOWN_SEC", 300u64)?,
            lock_sec: env_parse("LOCK_SEC", 60u64)?,
            manage_every_sec: env_parse("MANAGE_EVERY_SEC", 5u64)?,
            trail_update_every_sec: env_parse("TRAIL_UPDATE_EVERY_SEC", 30u64)?,
            exits_retry_every_sec: env_parse("EXITS_RETRY_EVERY_SEC", 20u64)?,
            failsafe_exits_max_tries: env_parse("FAILSAFE_EXITS_MAX_TRIES", 10u32)?,
            failsafe_flatten: env_bool("FAILSAFE_FLATTEN", true)?,

            trail_source: parse_trail_source(&env_str("TRAIL_SOURCE", "AGG"))?,
            trail_swing_lookback: env_parse("TRAIL_SWING_LOOKBACK", 120usize)?,
            trail_swing_lr: env_parse("TRAIL_SWING_LR", 3usize)?,
            trail_swing_buffer_usd: env_dec("TRAIL_SWING_BUFFER_USD", "25")?,
            trail_confirm_buffer_usd: env_dec("TRAIL_CONFIRM_BUFFER_USD", "0")?,
            trail_step_usd: env_dec("TRAIL_STEP_USD", "50")?,

            trade_mode: parse_trade_mode(&env_str("TRADE_MODE", "spot"))?,
            margin_isolated: env_bool("MARGIN_ISOLATED", false)?,
            margin_borrow_mode: parse_borrow_mode(&env_str("MARGIN_BORROW_MODE", "auto"))?,
            margin_borrow_buffer_pct: env_dec("MARGIN_BORROW_BUFFER_PCT", "0.3")?,

            invar_enabled: env_bool("INVAR_ENABLED", true)?,
            invar_every_sec: env_parse("INVAR_EVERY_SEC", 30u64)?,
            invar_throttle_sec: env_parse("INVAR_THROTTLE_SEC", 600u64)?,
            invar_grace_sec: env_parse("INVAR_GRACE_SEC", 20u64)?,
            i13_grace_sec: env_parse("I13_GRACE_SEC", 120u64)?,
            i13_escalate_sec: env_parse("I13_ESCALATE_SEC", 900u64)?,
            i13_kill_on_debt: env_bool("I13_KILL_ON_DEBT", false)?,

            tp1_be_max_attempts: env_parse("TP1_BE_MAX_ATTEMPTS", 5u32)?,
            tp1_be_cooldown_sec: env_parse("TP1_BE_COOLDOWN_SEC", 3600u64)?,
            sl_recon_fresh_sec: env_parse("SL_RECON_FRESH_SEC", 20u64)?,
            sl_watchdog_grace_sec: env_parse("SL_WATCHDOG_GRACE_SEC", 30u64)?,
            sl_watchdog_retry_sec: env_parse("SL_WATCHDOG_RETRY_SEC", 30u64)?,
            watchdog_max_attempts: env_parse("WATCHDOG_MAX_ATTEMPTS", 5u32)?,
            watchdog_cooldown_sec: env_parse("WATCHDOG_COOLDOWN_SEC", 3600u64)?,
            close_cleanup_retry_sec: env_parse("CLOSE_CLEANUP_RETRY_SEC", 60u64)?,
            snapshot_min_sec: env_parse("SNAPSHOT_MIN_SEC", 5u64)?,
            sync_exchange_throttle_sec: env_parse("SYNC_BINANCE_THROTTLE_SEC", 60u64)?,

            dedup_price_decimals: env_parse("DEDUP_PRICE_DECIMALS", 1u32)?,
            seen_keys_max: env_parse("SEEN_KEYS_MAX", 500usize)?,
            strict_source: env_bool("STRICT_SOURCE", false)?,

            log_max_lines: env_parse("LOG_MAX_LINES", 200usize)?,
            tail_lines: env_parse("TAIL_LINES", 300usize)?,
            max_peak_age_sec: env_parse("MAX_PEAK_AGE_SEC", 180u64)?,

            webhook_url: std::env::var("WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            webhook_user: env_str("WEBHOOK_USER", ""),
            webhook_pass: env_str("WEBHOOK_PASS", ""),

            signals_path: env_str("SIGNALS_PATH", "signals.jsonl"),
            bars_csv_path: env_str("BARS_CSV_PATH", "bars_1m.csv"),
            state_path: env_str("STATE_PATH", "executor_state.json"),
            state_backup_path: env_str("STATE_BACKUP_PATH", "executor_state.backup.json"),
            events_log_path: env_str("EVENTS_LOG_PATH", "executor_events.jsonl"),
            reports_log_path: env_str("REPORTS_LOG_PATH", "trade_reports.jsonl"),
            invar_meta_path: env_str("INVAR_META_PATH", "invariants_meta.json"),
            emergency_flag_path: env_str("EMERGENCY_FLAG_PATH", "emergency_shutdown.flag"),
            wake_flag_path: env_str("WAKE_FLAG_PATH", "wake_up.flag"),

            api_key: env_str("BINANCE_API_KEY", ""),
            api_secret: env_str("BINANCE_API_SECRET", ""),
            base_url: env_str("BINANCE_BASE_URL", "https://api.binance.com"),
        };

        cfg.validate()?;

        info!(
            symbol = %cfg.symbol,
            trade_mode = ?cfg.trade_mode,
            entry_mode = ?cfg.entry_mode,
            qty_usd = %cfg.qty_usd,
            manage_every_sec = cfg.manage_every_sec,
            "configuration loaded"
        );

        Ok(cfg)
    }

    /// Cross-field validation. Refuses configurations that would make the
    /// engine's behaviour ambiguous or unsafe.
    pub fn validate(&self) -> Result<()> {
        if self.qty_step <= Decimal::ZERO {
            bail!("QTY_STEP must be positive");
        }
        if self.tick_size <= Decimal::ZERO {
            bail!("TICK_SIZE must be positive");
        }
        if self.qty_usd <= Decimal::ZERO {
            bail!("QTY_USD must be positive");
        }
        if self.tp_r_list.len() < 2 {
            bail!("TP_R_LIST needs at least two R-multiples (TP1, TP2)");
        }
        if self.tp_r_list[0] >= self.tp_r_list[1] {
            bail!("TP_R_LIST must be strictly increasing");
        }
        if self.sl_pct <= Decimal::ZERO {
            bail!("SL_PCT must be positive");
        }
        if self.trail_swing_lr == 0 {
            bail!("TRAIL_SWING_LR must be at least 1");
        }
        if self.trail_swing_lookback <= self.trail_swing_lr * 2 {
            bail!("TRAIL_SWING_LOOKBACK must exceed twice TRAIL_SWING_LR");
        }
        // Mixed margin modes are refused: either the exchange manages borrow
        // via order side effects, or the coordinator does — never both.
        if self.trade_mode == TradeMode::Spot && self.margin_borrow_mode == BorrowMode::Manual {
            bail!("MARGIN_BORROW_MODE=manual requires TRADE_MODE=margin");
        }
        if self.margin_borrow_buffer_pct < Decimal::ZERO {
            bail!("MARGIN_BORROW_BUFFER_PCT must be non-negative");
        }
        Ok(())
    }

    /// The quote-asset distance of one R (the risk unit) given entry/stop.
    pub fn tp1_r(&self) -> Decimal {
        self.tp_r_list[0]
    }

    pub fn tp2_r(&self) -> Decimal {
        self.tp_r_list[1]
    }
}

fn parse_entry_mode(s: &str) -> Result<EntryMode> {
    match s.to_uppercase().as_str() {
        "LIMIT_ONLY" => Ok(EntryMode::LimitOnly),
        "LIMIT_THEN_MARKET" => Ok(EntryMode::LimitThenMarket),
        "MARKET_ONLY" => Ok(EntryMode::MarketOnly),
        other => bail!("invalid ENTRY_MODE={other}"),
    }
}

fn parse_trade_mode(s: &str) -> Result<TradeMode> {
    match s.to_lowercase().as_str() {
        "spot" => Ok(TradeMode::Spot),
        "margin" => Ok(TradeMode::Margin),
        other => bail!("invalid TRADE_MODE={other}"),
    }
}

fn parse_borrow_mode(s: &str) -> Result<BorrowMode> {
    match s.to_lowercase().as_str() {
        "auto" => Ok(BorrowMode::Auto),
        "manual" => Ok(BorrowMode::Manual),
        other => bail!("invalid MARGIN_BORROW_MODE={other}"),
    }
}

fn parse_planb_rule(s: &str) -> Result<PlanBDevRule> {
    match s.to_lowercase().as_str() {
        "either" => Ok(PlanBDevRule::Either),
        "both" => Ok(PlanBDevRule::Both),
        other => bail!("invalid PLANB_DEV_RULE={other}"),
    }
}

fn parse_trail_source(s: &str) -> Result<TrailSource> {
    match s.to_uppercase().as_str() {
        "AGG" => Ok(TrailSource::Agg),
        "BOOK" => Ok(TrailSource::Book),
        other => bail!("invalid TRAIL_SOURCE={other}"),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn base_config() -> Config {
        Config {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            qty_usd: dec!(100),
            qty_step: dec!(0.00001),
            tick_size: dec!(0.01),
            min_qty: dec!(0.00001),
            min_notional: dec!(5),
            sl_pct: dec!(0.5),
            tp_r_list: vec![dec!(1), dec!(2)],
            swing_mins: 60,
            entry_offset_usd: dec!(0.5),
            entry_mode: EntryMode::LimitThenMarket,
            live_entry_timeout_sec: 45,
            planb_max_dev_usd: dec!(150),
            planb_max_dev_r_mult: dec!(0.5),
            planb_dev_rule: PlanBDevRule::Either,
            poll_sec: 5,
            cooldown_sec: 300,
            lock_sec: 60,
            manage_every_sec: 5,
            trail_update_every_sec: 30,
            exits_retry_every_sec: 20,
            failsafe_exits_max_tries: 10,
            failsafe_flatten: true,
            trail_source: TrailSource::Agg,
            trail_swing_lookback: 120,
            trail_swing_lr: 3,
            trail_swing_buffer_usd: dec!(25),
            trail_confirm_buffer_usd: dec!(0),
            trail_step_usd: dec!(50),
            trade_mode: TradeMode::Spot,
            margin_isolated: false,
            margin_borrow_mode: BorrowMode::Auto,
            margin_borrow_buffer_pct: dec!(0.3),
            invar_enabled: true,
            invar_every_sec: 30,
            invar_throttle_sec: 600,
            invar_grace_sec: 20,
            i13_grace_sec: 120,
            i13_escalate_sec: 900,
            i13_kill_on_debt: false,
            tp1_be_max_attempts: 5,
            tp1_be_cooldown_sec: 3600,
            sl_recon_fresh_sec: 20,
            sl_watchdog_grace_sec: 30,
            sl_watchdog_retry_sec: 30,
            watchdog_max_attempts: 5,
            watchdog_cooldown_sec: 3600,
            close_cleanup_retry_sec: 60,
            snapshot_min_sec: 5,
            sync_exchange_throttle_sec: 60,
            dedup_price_decimals: 1,
            seen_keys_max: 500,
            strict_source: false,
            log_max_lines: 200,
            tail_lines: 300,
            max_peak_age_sec: 180,
            webhook_url: None,
            webhook_user: String::new(),
            webhook_pass: String::new(),
            signals_path: "signals.jsonl".into(),
            bars_csv_path: "bars_1m.csv".into(),
            state_path: "state.json".into(),
            state_backup_path: "state.backup.json".into(),
            events_log_path: "events.jsonl".into(),
            reports_log_path: "reports.jsonl".into(),
            invar_meta_path: "invar.json".into(),
            emergency_flag_path: "emergency_shutdown.flag".into(),
            wake_flag_path: "wake_up.flag".into(),
            api_key: String::new(),
            api_secret: String::new(),
            base_url: "https://api.binance.com".into(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_manual_borrow_on_spot() {
        let mut cfg = base_config();
        cfg.trade_mode = TradeMode::Spot;
        cfg.margin_borrow_mode = BorrowMode::Manual;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_manual_borrow_on_margin() {
        let mut cfg = base_config();
        cfg.trade_mode = TradeMode::Margin;
        cfg.margin_borrow_mode = BorrowMode::Manual;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_increasing_tp_list() {
        let mut cfg = base_config();
        cfg.tp_r_list = vec![dec!(2), dec!(1)];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_tiny_swing_lookback() {
        let mut cfg = base_config();
        cfg.trail_swing_lookback = 6;
        cfg.trail_swing_lr = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn entry_mode_parsing() {
        assert_eq!(parse_entry_mode("limit_only").unwrap(), EntryMode::LimitOnly);
        assert_eq!(
            parse_entry_mode("LIMIT_THEN_MARKET").unwrap(),
            EntryMode::LimitThenMarket
        );
        assert!(parse_entry_mode("YOLO").is_err());
    }
}
