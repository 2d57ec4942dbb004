// =============================================================================
// Binance REST API client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms; server-time
// drift is measured once at startup (and on demand) and folded into every
// signature timestamp.
//
// Error normalization: responses meaning "no such order" (codes -2011/-2013
// and their message variants) are mapped to the synthetic `Missing` order
// status so callers can treat an evaporated order as a terminal state
// instead of parsing error strings. Every other transport failure
// propagates as an error.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::binance::rate_limit::RateLimitTracker;
use crate::config::Config;
use crate::steps::fmt_step;
use crate::types::{OrderStatus, TradeMode};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Response of a successful order placement.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: u64,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
}

/// Snapshot of one tracked order from a status query.
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub order_id: u64,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub orig_qty: Decimal,
}

impl OrderInfo {
    /// The synthetic record returned when the venue does not know the order.
    fn missing(order_id: u64) -> Self {
        Self {
            order_id,
            status: OrderStatus::Missing,
            executed_qty: Decimal::ZERO,
            orig_qty: Decimal::ZERO,
        }
    }
}

/// One open order from the open-orders endpoint.
#[derive(Debug, Clone)]
pub struct LiveOrder {
    pub order_id: u64,
    pub client_order_id: String,
    pub side: String,
    pub order_type: String,
    pub price: Decimal,
    pub stop_price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
}

/// One outstanding margin liability.
#[derive(Debug, Clone)]
pub struct DebtEntry {
    pub asset: String,
    pub borrowed: Decimal,
    pub interest: Decimal,
}

impl DebtEntry {
    pub fn total(&self) -> Decimal {
        self.borrowed + self.interest
    }
}

/// Binance REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    secret: String,
    base_url: String,
    trade_mode: TradeMode,
    isolated: bool,
    http: reqwest::Client,
    time_offset_ms: Arc<AtomicI64>,
    rate_limits: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(cfg: &Config, rate_limits: Arc<RateLimitTracker>) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&cfg.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %cfg.base_url, trade_mode = ?cfg.trade_mode, "BinanceClient initialised");

        Self {
            secret: cfg.api_secret.clone(),
            base_url: cfg.base_url.clone(),
            trade_mode: cfg.trade_mode,
            isolated: cfg.margin_isolated,
            http,
            time_offset_ms: Arc::new(AtomicI64::new(0)),
            rate_limits,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    /// Signature timestamp: local clock corrected by the tracked offset.
    fn timestamp_ms(&self) -> i64 {
        Self::local_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// GET /api/v3/time — measure and store server-time drift.
    pub async fn sync_server_time(&self) -> Result<i64> {
        let url = format!("{}/api/v3/time", self.base_url);
        let before = Self::local_ms();
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/time request failed")?
            .json()
            .await
            .context("failed to parse server time response")?;
        let after = Self::local_ms();

        let server = body["serverTime"]
            .as_i64()
            .context("server time response missing 'serverTime'")?;
        // Midpoint of the request as the local reference.
        let offset = server - (before + after) / 2;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "server time synchronised");
        Ok(offset)
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send a signed request and return the parsed body, normalizing
    /// rate-limit failures into the tracker. `Err` carries the venue's
    /// error body text when available.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .http
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        self.rate_limits.update_from_headers(resp.headers());

        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            let code = body["code"].as_i64().unwrap_or(0);
            if status.as_u16() == 429 || status.as_u16() == 418 || code == -1003 {
                self.rate_limits
                    .record_rate_limit_error(path, (Self::local_ms() / 1000) as u64);
            }
            anyhow::bail!("Binance {method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Path of the order endpoint for the configured account type.
    fn order_path(&self) -> &'static str {
        match self.trade_mode {
            TradeMode::Spot => "/api/v3/order",
            TradeMode::Margin => "/sapi/v1/margin/order",
        }
    }

    fn open_orders_path(&self) -> &'static str {
        match self.trade_mode {
            TradeMode::Spot => "/api/v3/openOrders",
            TradeMode::Margin => "/sapi/v1/margin/openOrders",
        }
    }

    fn isolated_param(&self) -> &'static str {
        if self.trade_mode == TradeMode::Margin && self.isolated {
            "&isIsolated=TRUE"
        } else {
            ""
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Place a LIMIT GTC order.
    pub async fn place_limit(
        &self,
        symbol: &str,
        side: &str,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
        side_effect: Option<&str>,
    ) -> Result<PlacedOrder> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=LIMIT&timeInForce=GTC&quantity={}&price={}&newClientOrderId={client_id}",
            fmt_step(qty),
            fmt_step(price),
        );
        params.push_str(self.isolated_param());
        if let Some(se) = side_effect {
            params.push_str(&format!("&sideEffectType={se}"));
        }

        debug!(symbol, side, qty = %qty, price = %price, "placing LIMIT order");
        let body = self
            .signed_request(reqwest::Method::POST, self.order_path(), &params)
            .await?;
        Self::parse_placed(&body)
    }

    /// Place a MARKET order.
    pub async fn place_market(
        &self,
        symbol: &str,
        side: &str,
        qty: Decimal,
        client_id: &str,
        side_effect: Option<&str>,
    ) -> Result<PlacedOrder> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={}&newClientOrderId={client_id}",
            fmt_step(qty),
        );
        params.push_str(self.isolated_param());
        if let Some(se) = side_effect {
            params.push_str(&format!("&sideEffectType={se}"));
        }

        debug!(symbol, side, qty = %qty, "placing MARKET order");
        let body = self
            .signed_request(reqwest::Method::POST, self.order_path(), &params)
            .await?;
        Self::parse_placed(&body)
    }

    /// Place a STOP_LOSS_LIMIT order (stop trigger + limit price).
    #[allow(clippy::too_many_arguments)]
    pub async fn place_stop_loss_limit(
        &self,
        symbol: &str,
        side: &str,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
        client_id: &str,
        side_effect: Option<&str>,
    ) -> Result<PlacedOrder> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=STOP_LOSS_LIMIT&timeInForce=GTC&quantity={}&stopPrice={}&price={}&newClientOrderId={client_id}",
            fmt_step(qty),
            fmt_step(stop_price),
            fmt_step(limit_price),
        );
        params.push_str(self.isolated_param());
        if let Some(se) = side_effect {
            params.push_str(&format!("&sideEffectType={se}"));
        }

        debug!(symbol, side, qty = %qty, stop = %stop_price, "placing STOP_LOSS_LIMIT order");
        let body = self
            .signed_request(reqwest::Method::POST, self.order_path(), &params)
            .await?;
        Self::parse_placed(&body)
    }

    /// Cancel an order. `Ok(false)` means the venue no longer knows the
    /// order — already gone; the caller's status verification decides what
    /// that means.
    pub async fn cancel(&self, symbol: &str, order_id: u64) -> Result<bool> {
        let params = format!("symbol={symbol}&orderId={order_id}{}", self.isolated_param());

        debug!(symbol, order_id, "cancelling order");
        match self
            .signed_request(reqwest::Method::DELETE, self.order_path(), &params)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_unknown_order_err(&e) => {
                debug!(order_id, "cancel target already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Query one order's status. Unknown-order responses normalize to a
    /// synthetic `Missing` record instead of an error.
    pub async fn order_status(&self, symbol: &str, order_id: u64) -> Result<OrderInfo> {
        let params = format!("symbol={symbol}&orderId={order_id}{}", self.isolated_param());

        match self
            .signed_request(reqwest::Method::GET, self.order_path(), &params)
            .await
        {
            Ok(body) => Ok(OrderInfo {
                order_id,
                status: OrderStatus::parse(body["status"].as_str().unwrap_or("")),
                executed_qty: parse_dec(&body["executedQty"]),
                orig_qty: parse_dec(&body["origQty"]),
            }),
            Err(e) if is_unknown_order_err(&e) => Ok(OrderInfo::missing(order_id)),
            Err(e) => Err(e),
        }
    }

    /// All open orders for `symbol`.
    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<LiveOrder>> {
        let params = format!("symbol={symbol}{}", self.isolated_param());
        let body = self
            .signed_request(reqwest::Method::GET, self.open_orders_path(), &params)
            .await?;

        let raw = body.as_array().context("openOrders response is not an array")?;
        let orders = raw
            .iter()
            .map(|o| LiveOrder {
                order_id: o["orderId"].as_u64().unwrap_or(0),
                client_order_id: o["clientOrderId"].as_str().unwrap_or("").to_string(),
                side: o["side"].as_str().unwrap_or("").to_string(),
                order_type: o["type"].as_str().unwrap_or("").to_string(),
                price: parse_dec(&o["price"]),
                stop_price: parse_dec(&o["stopPrice"]),
                orig_qty: parse_dec(&o["origQty"]),
                executed_qty: parse_dec(&o["executedQty"]),
                status: OrderStatus::parse(o["status"].as_str().unwrap_or("")),
            })
            .collect::<Vec<_>>();

        debug!(symbol, count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/bookTicker (public) — mid of best bid/ask.
    pub async fn mid_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/api/v3/ticker/bookTicker?symbol={symbol}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/bookTicker request failed")?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse bookTicker response")?;
        if !status.is_success() {
            anyhow::bail!("Binance bookTicker returned {status}: {body}");
        }

        let bid = parse_dec(&body["bidPrice"]);
        let ask = parse_dec(&body["askPrice"]);
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
            anyhow::bail!("bookTicker returned a non-positive quote: {body}");
        }
        Ok((bid + ask) / Decimal::TWO)
    }

    // -------------------------------------------------------------------------
    // Margin
    // -------------------------------------------------------------------------

    /// POST /sapi/v1/margin/loan — borrow `amount` of `asset`.
    pub async fn margin_borrow(&self, symbol: &str, asset: &str, amount: Decimal) -> Result<()> {
        let mut params = format!("asset={asset}&amount={}", fmt_step(amount));
        if self.isolated {
            params.push_str(&format!("&isIsolated=TRUE&symbol={symbol}"));
        }
        self.signed_request(reqwest::Method::POST, "/sapi/v1/margin/loan", &params)
            .await?;
        debug!(asset, amount = %amount, "margin borrow accepted");
        Ok(())
    }

    /// POST /sapi/v1/margin/repay — repay `amount` of `asset`.
    pub async fn margin_repay(&self, symbol: &str, asset: &str, amount: Decimal) -> Result<()> {
        let mut params = format!("asset={asset}&amount={}", fmt_step(amount));
        if self.isolated {
            params.push_str(&format!("&isIsolated=TRUE&symbol={symbol}"));
        }
        self.signed_request(reqwest::Method::POST, "/sapi/v1/margin/repay", &params)
            .await?;
        debug!(asset, amount = %amount, "margin repay accepted");
        Ok(())
    }

    /// Outstanding liabilities (borrowed + interest) for the margin
    /// account. Empty for an account with no debt.
    pub async fn margin_debt(&self, symbol: &str) -> Result<Vec<DebtEntry>> {
        let (path, params) = if self.isolated {
            (
                "/sapi/v1/margin/isolated/account",
                format!("symbols={symbol}"),
            )
        } else {
            ("/sapi/v1/margin/account", String::new())
        };
        let body = self
            .signed_request(reqwest::Method::GET, path, &params)
            .await?;

        let mut debts = Vec::new();
        let mut push_asset = |v: &Value| {
            let borrowed = parse_dec(&v["borrowed"]);
            let interest = parse_dec(&v["interest"]);
            if borrowed > Decimal::ZERO || interest > Decimal::ZERO {
                debts.push(DebtEntry {
                    asset: v["asset"].as_str().unwrap_or("").to_string(),
                    borrowed,
                    interest,
                });
            }
        };

        if self.isolated {
            if let Some(assets) = body["assets"].as_array() {
                for a in assets {
                    push_asset(&a["baseAsset"]);
                    push_asset(&a["quoteAsset"]);
                }
            }
        } else if let Some(assets) = body["userAssets"].as_array() {
            for a in assets {
                push_asset(a);
            }
        }

        debug!(count = debts.len(), "margin debt snapshot retrieved");
        Ok(debts)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn parse_placed(body: &Value) -> Result<PlacedOrder> {
        let order_id = body["orderId"]
            .as_u64()
            .context("order response missing 'orderId'")?;
        Ok(PlacedOrder {
            order_id,
            status: OrderStatus::parse(body["status"].as_str().unwrap_or("NEW")),
            executed_qty: parse_dec(&body["executedQty"]),
        })
    }
}

/// Parse a JSON value that may be a string or a number into `Decimal`;
/// absent or malformed values collapse to zero (the venue sends numeric
/// strings everywhere that matters).
pub fn parse_dec(val: &Value) -> Decimal {
    if let Some(s) = val.as_str() {
        s.parse().unwrap_or(Decimal::ZERO)
    } else if let Some(f) = val.as_f64() {
        Decimal::from_f64(f).unwrap_or(Decimal::ZERO)
    } else {
        Decimal::ZERO
    }
}

/// True when the error body means "no such order" (codes -2011/-2013 and
/// their message variants).
pub fn is_unknown_order_err(e: &anyhow::Error) -> bool {
    let text = format!("{e}");
    text.contains("\"code\":-2013")
        || text.contains("\"code\":-2011")
        || text.contains("Order does not exist")
        || text.contains("Unknown order sent")
}

/// True when the error body means the account lacks balance for the
/// requested order — a retry signal while an old order still holds funds.
pub fn is_insufficient_balance_err(e: &anyhow::Error) -> bool {
    let text = format!("{e}");
    text.contains("\"code\":-2010") || text.to_lowercase().contains("insufficient balance")
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("trade_mode", &self.trade_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
