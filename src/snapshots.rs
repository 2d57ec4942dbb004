// =============================================================================
// Exchange snapshots — throttled open-orders and mid-price caches
// =============================================================================
//
// Both caches cap API spend: the open-orders list refreshes at most once per
// `SNAPSHOT_MIN_SEC`, the mid price on consumer demand. Consumers gate on
// `is_fresh` before trusting a read. Status polls and debt checks bypass
// these caches entirely.
// =============================================================================

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::debug;

use crate::binance::client::{BinanceClient, LiveOrder};

/// Throttled cache of the venue's open orders for one symbol.
#[derive(Debug, Default)]
pub struct OpenOrdersSnapshot {
    orders: Vec<LiveOrder>,
    updated_at_s: u64,
    min_refresh_sec: u64,
}

impl OpenOrdersSnapshot {
    pub fn new(min_refresh_sec: u64) -> Self {
        Self {
            orders: Vec::new(),
            updated_at_s: 0,
            min_refresh_sec,
        }
    }

    /// Refresh from the exchange unless the cache is younger than the
    /// throttle. `force` bypasses the throttle (reconciliation needs truth).
    pub async fn refresh(
        &mut self,
        client: &BinanceClient,
        symbol: &str,
        now_s: u64,
        force: bool,
    ) -> Result<()> {
        if !force && now_s.saturating_sub(self.updated_at_s) < self.min_refresh_sec {
            return Ok(());
        }
        self.orders = client.open_orders(symbol).await?;
        self.updated_at_s = now_s;
        debug!(count = self.orders.len(), "open-orders snapshot refreshed");
        Ok(())
    }

    pub fn orders(&self) -> &[LiveOrder] {
        &self.orders
    }

    pub fn contains_order(&self, order_id: u64) -> bool {
        self.orders.iter().any(|o| o.order_id == order_id)
    }

    pub fn get(&self, order_id: u64) -> Option<&LiveOrder> {
        self.orders.iter().find(|o| o.order_id == order_id)
    }

    pub fn age_secs(&self, now_s: u64) -> u64 {
        now_s.saturating_sub(self.updated_at_s)
    }

    pub fn is_fresh(&self, now_s: u64, within_sec: u64) -> bool {
        self.updated_at_s > 0 && self.age_secs(now_s) <= within_sec
    }
}

/// Last observed book-ticker mid price.
#[derive(Debug, Default)]
pub struct MidPriceSnapshot {
    mid: Option<Decimal>,
    updated_at_s: u64,
}

impl MidPriceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a fresh mid price and cache it.
    pub async fn refresh(
        &mut self,
        client: &BinanceClient,
        symbol: &str,
        now_s: u64,
    ) -> Result<Decimal> {
        let mid = client.mid_price(symbol).await?;
        self.mid = Some(mid);
        self.updated_at_s = now_s;
        debug!(mid = %mid, "mid-price snapshot refreshed");
        Ok(mid)
    }

    pub fn mid(&self) -> Option<Decimal> {
        self.mid
    }

    pub fn age_secs(&self, now_s: u64) -> u64 {
        now_s.saturating_sub(self.updated_at_s)
    }

    pub fn is_fresh(&self, now_s: u64, within_sec: u64) -> bool {
        self.updated_at_s > 0 && self.age_secs(now_s) <= within_sec
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::OrderStatus;
    use rust_decimal_macros::dec;

    pub(crate) fn live_order(order_id: u64, status: OrderStatus) -> LiveOrder {
        LiveOrder {
            order_id,
            client_order_id: format!("c{order_id}"),
            side: "SELL".into(),
            order_type: "STOP_LOSS_LIMIT".into(),
            price: dec!(94800),
            stop_price: dec!(94810),
            orig_qty: dec!(0.001),
            executed_qty: Decimal::ZERO,
            status,
        }
    }

    #[test]
    fn empty_snapshot_is_never_fresh() {
        let snap = OpenOrdersSnapshot::new(5);
        assert!(!snap.is_fresh(100, 3600));
    }

    #[test]
    fn freshness_window() {
        let mut snap = OpenOrdersSnapshot::new(5);
        snap.orders = vec![live_order(7, OrderStatus::New)];
        snap.updated_at_s = 100;
        assert!(snap.is_fresh(104, 5));
        assert!(!snap.is_fresh(120, 5));
        assert_eq!(snap.age_secs(104), 4);
        assert!(snap.contains_order(7));
        assert!(!snap.contains_order(8));
    }

    #[test]
    fn mid_price_freshness() {
        let mut snap = MidPriceSnapshot::new();
        assert!(snap.mid().is_none());
        snap.mid = Some(dec!(95000.5));
        snap.updated_at_s = 50;
        assert!(snap.is_fresh(52, 5));
        assert!(!snap.is_fresh(60, 5));
    }
}
