// =============================================================================
// Signal deduplication — stable bucket keys over a bounded recent-key set
// =============================================================================
//
// Key formula (stable across restarts and whitespace variation):
//   "{action}|{ts bucketed to minute}|{direction}|{price rounded to D dp}"
//
// The set is FIFO-bounded and guarded by an algorithm fingerprint: when the
// key formula or its parameters change, a persisted set from the old formula
// is worthless and gets discarded on load.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::tail::tail_lines;
use crate::types::Side;

/// Bump when the key formula itself changes shape.
const ALGO_VERSION: u32 = 2;

/// One parsed PEAK signal line.
#[derive(Debug, Clone, Deserialize)]
pub struct PeakSignal {
    pub action: String,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub price: Decimal,
    #[serde(default)]
    pub source: Option<String>,
}

impl PeakSignal {
    /// Parse one JSONL line; `None` for non-PEAK actions or malformed lines.
    pub fn parse(line: &str) -> Option<Self> {
        let sig: Self = match serde_json::from_str(line) {
            Ok(s) => s,
            Err(_) => return None,
        };
        if sig.action != "PEAK" {
            return None;
        }
        Some(sig)
    }

    pub fn side(&self) -> Option<Side> {
        match self.kind.as_str() {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }
}

/// Bounded FIFO of recently seen dedup keys, persisted inside the state
/// document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeenKeys {
    #[serde(default)]
    keys: VecDeque<String>,
    #[serde(default)]
    fingerprint: u64,
}

/// Parameters that participate in the fingerprint.
#[derive(Debug, Clone, Copy)]
pub struct DedupParams {
    pub price_decimals: u32,
    pub strict_source: bool,
    pub max_keys: usize,
}

/// Fingerprint over the algorithm version and its configured parameters.
pub fn fingerprint(params: &DedupParams) -> u64 {
    let mut h = DefaultHasher::new();
    ALGO_VERSION.hash(&mut h);
    params.price_decimals.hash(&mut h);
    params.strict_source.hash(&mut h);
    h.finish()
}

/// Build the dedup key for one signal.
pub fn signal_key(sig: &PeakSignal, params: &DedupParams) -> String {
    let minute = sig.ts.format("%Y-%m-%dT%H:%M");
    let price = sig.price.round_dp(params.price_decimals).normalize();
    format!("{}|{}|{}|{}", sig.action, minute, sig.kind, price)
}

impl SeenKeys {
    /// Validate the persisted set against the current fingerprint; a
    /// mismatch discards the set (old formula, old parameters).
    pub fn validate(&mut self, params: &DedupParams) {
        let current = fingerprint(params);
        if self.fingerprint != current {
            if !self.keys.is_empty() {
                warn!(
                    persisted = self.fingerprint,
                    current,
                    dropped = self.keys.len(),
                    "dedup fingerprint changed — discarding seen-key set"
                );
            }
            self.keys.clear();
            self.fingerprint = current;
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Insert a key, evicting the oldest when the bound is hit. Returns
    /// false if the key was already present.
    pub fn insert(&mut self, key: String, max_keys: usize) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.keys.push_back(key);
        while self.keys.len() > max_keys {
            self.keys.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Seed the set from the newest `tail_n` lines of the signal log so a
    /// fresh boot does not replay recent signals. Missing log file is fine —
    /// there is simply nothing to seed.
    pub fn bootstrap(&mut self, signals_path: &str, tail_n: usize, params: &DedupParams) {
        self.validate(params);

        let lines = match tail_lines(signals_path, tail_n) {
            Ok(l) => l,
            Err(e) => {
                debug!(error = %e, path = signals_path, "no signal log to bootstrap dedup from");
                return;
            }
        };

        let mut seeded = 0usize;
        for line in &lines {
            if let Some(sig) = PeakSignal::parse(line) {
                if self.insert(signal_key(&sig, params), params.max_keys) {
                    seeded += 1;
                }
            }
        }
        info!(
            scanned = lines.len(),
            seeded,
            total = self.keys.len(),
            "dedup set bootstrapped from signal log tail"
        );
    }
}

/// Helper for tests and intake: dedup-filter a batch of raw lines, newest
/// last, returning the signals that survive.
pub fn filter_new<'a>(
    lines: impl Iterator<Item = &'a str>,
    seen: &mut SeenKeys,
    params: &DedupParams,
) -> Vec<PeakSignal> {
    let mut out = Vec::new();
    let mut batch_seen: HashSet<String> = HashSet::new();
    for line in lines {
        let Some(sig) = PeakSignal::parse(line) else {
            continue;
        };
        let key = signal_key(&sig, params);
        if seen.contains(&key) || !batch_seen.insert(key) {
            continue;
        }
        out.push(sig);
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PARAMS: DedupParams = DedupParams {
        price_decimals: 1,
        strict_source: false,
        max_keys: 500,
    };

    fn sig(line: &str) -> PeakSignal {
        PeakSignal::parse(line).expect("valid PEAK line")
    }

    #[test]
    fn key_formula_shape() {
        let s = sig(r#"{"action":"PEAK","ts":"2025-01-13T20:00:42Z","kind":"long","price":95000.04}"#);
        assert_eq!(signal_key(&s, &PARAMS), "PEAK|2025-01-13T20:00|long|95000");
    }

    #[test]
    fn key_stable_under_whitespace_variation() {
        let a = sig(r#"{"action":"PEAK","ts":"2025-01-13T20:00:42Z","kind":"long","price":95000.0}"#);
        let b = sig(
            r#"{ "action" : "PEAK" , "ts" : "2025-01-13T20:00:42Z" , "kind" : "long" , "price" : 95000.0 }"#,
        );
        assert_eq!(signal_key(&a, &PARAMS), signal_key(&b, &PARAMS));
    }

    #[test]
    fn same_minute_same_bucket() {
        let a = sig(r#"{"action":"PEAK","ts":"2025-01-13T20:00:01Z","kind":"long","price":95000.0}"#);
        let b = sig(r#"{"action":"PEAK","ts":"2025-01-13T20:00:59Z","kind":"long","price":95000.0}"#);
        assert_eq!(signal_key(&a, &PARAMS), signal_key(&b, &PARAMS));
    }

    #[test]
    fn price_rounding_merges_nearby_signals() {
        let a = sig(r#"{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.04}"#);
        let b = sig(r#"{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.01}"#);
        assert_eq!(signal_key(&a, &PARAMS), signal_key(&b, &PARAMS));
    }

    #[test]
    fn non_peak_actions_ignored() {
        assert!(PeakSignal::parse(r#"{"action":"HEARTBEAT","ts":"2025-01-13T20:00:00Z","kind":"long","price":1}"#).is_none());
        assert!(PeakSignal::parse("not json").is_none());
    }

    #[test]
    fn fifo_eviction_respects_bound() {
        let mut seen = SeenKeys::default();
        for i in 0..10 {
            seen.insert(format!("k{i}"), 5);
        }
        assert_eq!(seen.len(), 5);
        assert!(!seen.contains("k4"));
        assert!(seen.contains("k5"));
        assert!(seen.contains("k9"));
    }

    #[test]
    fn fingerprint_mismatch_discards_set() {
        let mut seen = SeenKeys::default();
        seen.validate(&PARAMS);
        seen.insert("a".into(), 500);

        // Same params: survives.
        seen.validate(&PARAMS);
        assert_eq!(seen.len(), 1);

        // Changed decimals: discarded.
        let changed = DedupParams {
            price_decimals: 2,
            ..PARAMS
        };
        seen.validate(&changed);
        assert!(seen.is_empty());
    }

    #[test]
    fn replay_is_idempotent() {
        let lines = [
            r#"{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.0}"#,
            r#"{"action":"PEAK","ts":"2025-01-13T20:01:00Z","kind":"short","price":95100.0}"#,
        ];
        let mut seen = SeenKeys::default();
        seen.validate(&PARAMS);

        let first = filter_new(lines.iter().copied(), &mut seen, &PARAMS);
        for s in &first {
            seen.insert(signal_key(s, &PARAMS), PARAMS.max_keys);
        }
        assert_eq!(first.len(), 2);

        // Replaying the same tail produces nothing new.
        let second = filter_new(lines.iter().copied(), &mut seen, &PARAMS);
        assert!(second.is_empty());
    }

    #[test]
    fn bootstrap_seeds_from_tail() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, r#"{{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.0}}"#).unwrap();
        writeln!(f, r#"{{"action":"NOISE","ts":"2025-01-13T20:00:30Z","kind":"long","price":1.0}}"#).unwrap();
        writeln!(f, r#"{{"action":"PEAK","ts":"2025-01-13T20:01:00Z","kind":"short","price":95100.0}}"#).unwrap();
        f.flush().unwrap();

        let mut seen = SeenKeys::default();
        seen.bootstrap(f.path().to_str().unwrap(), 300, &PARAMS);
        assert_eq!(seen.len(), 2);
    }
}
