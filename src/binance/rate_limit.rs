// =============================================================================
// Rate-limit tracker — API weight usage and rate-limit-error window
// =============================================================================
//
// Binance reports request-weight consumption in the `X-MBX-USED-WEIGHT-1M`
// response header. The tracker keeps that counter plus a short window of
// rate-limit-like failures (HTTP 429/418, error code -1003) per endpoint;
// the I10 anomaly detector reads the window out of band.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Soft warning threshold for the one-minute weight counter.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// How many recent rate-limit errors to retain.
const ERROR_WINDOW: usize = 32;

/// One recorded rate-limit-like failure.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub endpoint: String,
    pub at_s: u64,
}

/// Thread-safe tracker shared between the adapter (writer) and the anomaly
/// detectors (readers).
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    errors: Mutex<VecDeque<RateLimitError>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Update the weight counter from the response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(val) = headers.get("X-MBX-USED-WEIGHT-1M") {
            if let Some(weight) = val.to_str().ok().and_then(|s| s.parse::<u32>().ok()) {
                self.used_weight_1m.store(weight, Ordering::Relaxed);
                if weight >= WEIGHT_WARN_THRESHOLD {
                    warn!(weight, "API weight usage approaching the venue limit");
                } else {
                    debug!(weight, "API weight updated");
                }
            }
        }
    }

    /// Record one rate-limit-like failure for `endpoint`.
    pub fn record_rate_limit_error(&self, endpoint: &str, now_s: u64) {
        let mut errors = self.errors.lock();
        errors.push_back(RateLimitError {
            endpoint: endpoint.to_string(),
            at_s: now_s,
        });
        while errors.len() > ERROR_WINDOW {
            errors.pop_front();
        }
    }

    pub fn used_weight_1m(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    /// Count of rate-limit errors within the last `window_sec`, and the
    /// endpoint that failed most — what I10 alerts on.
    pub fn recent_errors(&self, now_s: u64, window_sec: u64) -> (usize, Option<String>) {
        let errors = self.errors.lock();
        let recent: Vec<&RateLimitError> = errors
            .iter()
            .filter(|e| now_s.saturating_sub(e.at_s) <= window_sec)
            .collect();

        let mut top: Option<(String, usize)> = None;
        for e in &recent {
            let count = recent.iter().filter(|o| o.endpoint == e.endpoint).count();
            match &top {
                Some((_, best)) if *best >= count => {}
                _ => top = Some((e.endpoint.clone(), count)),
            }
        }
        (recent.len(), top.map(|(ep, _)| ep))
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_window_is_bounded() {
        let t = RateLimitTracker::new();
        for i in 0..50 {
            t.record_rate_limit_error("/api/v3/order", 1000 + i);
        }
        let (count, _) = t.recent_errors(1050, 3600);
        assert_eq!(count, ERROR_WINDOW);
    }

    #[test]
    fn recent_errors_respects_window() {
        let t = RateLimitTracker::new();
        t.record_rate_limit_error("/api/v3/order", 1000);
        t.record_rate_limit_error("/api/v3/openOrders", 2000);
        let (count, top) = t.recent_errors(2010, 60);
        assert_eq!(count, 1);
        assert_eq!(top.as_deref(), Some("/api/v3/openOrders"));
    }

    #[test]
    fn top_endpoint_is_most_frequent() {
        let t = RateLimitTracker::new();
        t.record_rate_limit_error("/api/v3/order", 100);
        t.record_rate_limit_error("/api/v3/order", 101);
        t.record_rate_limit_error("/api/v3/openOrders", 102);
        let (count, top) = t.recent_errors(110, 3600);
        assert_eq!(count, 3);
        assert_eq!(top.as_deref(), Some("/api/v3/order"));
    }
}
