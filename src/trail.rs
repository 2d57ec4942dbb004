// =============================================================================
// Swing trailing engine — fractal extremes over the normalized bar feed
// =============================================================================
//
// Reads the bar CSV (schema v2) via the reverse tail reader — never a full
// scan. Failure policy:
//   fail-loud   — header differs from the v2 schema: hard error, the feed
//                 producer and the engine disagree about the world.
//   fail-closed — missing or empty file: no bars, no trailing; `Ok(None)`.
//
// A fractal swing is a bar whose extreme is strictly beyond every neighbour
// within `radius` bars on both sides. The desired stop trails the last such
// swing by a fixed buffer.
// =============================================================================

use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use tracing::debug;

use crate::tail::tail_lines;
use crate::types::Side;

/// Exact, ordered v2 header of the normalized bar feed.
pub const BAR_HEADER_V2: &str =
    "Timestamp,Trades,TotalQty,AvgSize,BuyQty,SellQty,AvgPrice,ClosePrice,HiPrice,LowPrice";

/// One minute bar, reduced to the fields the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bar {
    pub ts: String,
    pub close: Decimal,
    pub hi: Decimal,
    pub low: Decimal,
}

impl Bar {
    /// Parse one CSV data line; `None` for malformed lines.
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 10 {
            return None;
        }
        Some(Self {
            ts: fields[0].to_string(),
            close: fields[7].trim().parse().ok()?,
            hi: fields[8].trim().parse().ok()?,
            low: fields[9].trim().parse().ok()?,
        })
    }
}

/// Read the newest `n` bars from the feed, oldest first.
///
/// `Ok(None)` — file missing or holds no data rows (fail-closed).
/// `Err`      — header mismatch (fail-loud) or I/O failure mid-read.
pub fn read_recent_bars(path: impl AsRef<Path>, n: usize) -> Result<Option<Vec<Bar>>> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "bar feed missing — trailing stays closed");
        return Ok(None);
    }

    // Header lives on the first line; validate it without scanning the body.
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open bar feed {}", path.display()))?;
    let mut header = String::new();
    BufReader::new(file)
        .read_line(&mut header)
        .with_context(|| format!("failed to read bar feed header {}", path.display()))?;
    let header = header.trim_end();

    if header.is_empty() {
        debug!(path = %path.display(), "bar feed empty — trailing stays closed");
        return Ok(None);
    }
    if header != BAR_HEADER_V2 {
        bail!(
            "bar feed schema mismatch in {}: expected v2 header '{}', found '{}'",
            path.display(),
            BAR_HEADER_V2,
            header
        );
    }

    // One extra line in case the tail window includes the header.
    let lines = tail_lines(path, n + 1)?;
    let bars: Vec<Bar> = lines
        .iter()
        .filter(|l| l.as_str() != BAR_HEADER_V2)
        .filter_map(|l| Bar::parse(l))
        .collect();

    if bars.is_empty() {
        debug!(path = %path.display(), "bar feed has no data rows — trailing stays closed");
        return Ok(None);
    }
    let start = bars.len().saturating_sub(n);
    Ok(Some(bars[start..].to_vec()))
}

/// Find the last fractal swing extreme in `bars` for `side`.
///
/// Index `i` qualifies when `radius <= i < len - radius` and the bar's
/// extreme (LowPrice for longs, HiPrice for shorts) is strictly beyond all
/// neighbours within `radius` on both sides.
pub fn swing_extreme(bars: &[Bar], side: Side, radius: usize) -> Option<Decimal> {
    if radius == 0 || bars.len() <= radius * 2 {
        return None;
    }

    let value = |i: usize| -> Decimal {
        if side.is_long() {
            bars[i].low
        } else {
            bars[i].hi
        }
    };
    let beats = |candidate: Decimal, other: Decimal| -> bool {
        if side.is_long() {
            candidate < other
        } else {
            candidate > other
        }
    };

    for i in (radius..bars.len() - radius).rev() {
        let v = value(i);
        let strict = (i - radius..i)
            .chain(i + 1..=i + radius)
            .all(|j| beats(v, value(j)));
        if strict {
            return Some(v);
        }
    }
    None
}

/// Desired stop from the last swing: `swing_low - buffer` for longs,
/// `swing_high + buffer` for shorts.
pub fn desired_stop(bars: &[Bar], side: Side, radius: usize, buffer: Decimal) -> Option<Decimal> {
    let swing = swing_extreme(bars, side, radius)?;
    Some(match side {
        Side::Long => swing - buffer,
        Side::Short => swing + buffer,
    })
}

/// Bar-close confirmation: the close must cross `reference` by
/// `confirm_buffer` in the favourable direction before trailing activates.
pub fn close_confirms(close: Decimal, reference: Decimal, side: Side, confirm_buffer: Decimal) -> bool {
    match side {
        Side::Long => close >= reference + confirm_buffer,
        Side::Short => close <= reference - confirm_buffer,
    }
}

/// File-backed engine bound to the configured feed and swing parameters.
#[derive(Debug, Clone)]
pub struct TrailEngine {
    path: String,
    lookback: usize,
    radius: usize,
    buffer: Decimal,
    confirm_buffer: Decimal,
}

impl TrailEngine {
    pub fn new(
        path: String,
        lookback: usize,
        radius: usize,
        buffer: Decimal,
        confirm_buffer: Decimal,
    ) -> Self {
        Self {
            path,
            lookback,
            radius,
            buffer,
            confirm_buffer,
        }
    }

    /// Compute the desired trailing stop from the current feed tail.
    /// `Ok(None)` when the feed is closed or shows no qualifying swing.
    pub fn desired_stop(&self, side: Side) -> Result<Option<Decimal>> {
        let Some(bars) = read_recent_bars(&self.path, self.lookback)? else {
            return Ok(None);
        };
        Ok(desired_stop(&bars, side, self.radius, self.buffer))
    }

    /// Swing-based stop for a fresh entry over a `swing_mins` window;
    /// `Ok(None)` lets the caller fall back to the percentage stop.
    pub fn entry_stop(&self, side: Side, swing_mins: usize) -> Result<Option<Decimal>> {
        let Some(bars) = read_recent_bars(&self.path, swing_mins)? else {
            return Ok(None);
        };
        Ok(desired_stop(&bars, side, self.radius, self.buffer))
    }

    /// Whether the latest bar close confirms activation against
    /// `reference`. Fail-closed: no feed means no confirmation.
    pub fn close_confirms(&self, side: Side, reference: Decimal) -> Result<bool> {
        let Some(bars) = read_recent_bars(&self.path, self.radius * 2 + 1)? else {
            return Ok(false);
        };
        let Some(last) = bars.last() else {
            return Ok(false);
        };
        Ok(close_confirms(last.close, reference, side, self.confirm_buffer))
    }

    /// Age gate for the feed-freshness invariant: the timestamp of the
    /// newest bar, if any.
    pub fn latest_bar_ts(&self) -> Result<Option<String>> {
        let Some(bars) = read_recent_bars(&self.path, 1)? else {
            return Ok(None);
        };
        Ok(bars.last().map(|b| b.ts.clone()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn bar(close: &str, hi: &str, low: &str) -> Bar {
        Bar {
            ts: "2025-01-13T20:00:00Z".into(),
            close: close.parse().unwrap(),
            hi: hi.parse().unwrap(),
            low: low.parse().unwrap(),
        }
    }

    fn bars_from_lows(lows: &[i64]) -> Vec<Bar> {
        lows.iter()
            .map(|l| bar(&format!("{l}"), &format!("{}", l + 50), &format!("{l}")))
            .collect()
    }

    #[test]
    fn fractal_long_finds_strict_low() {
        // Lows: the dip at 94800 is strictly below 2 neighbours each side.
        let bars = bars_from_lows(&[95000, 94950, 94800, 94900, 95050, 95100, 95150]);
        let swing = swing_extreme(&bars, Side::Long, 2).unwrap();
        assert_eq!(swing, dec!(94800));
    }

    #[test]
    fn fractal_prefers_last_qualifying_swing() {
        let bars = bars_from_lows(&[95000, 94700, 94900, 95000, 94800, 94950, 95100]);
        // Both index 1 (94700) and index 4 (94800) are radius-1 fractals;
        // the later one wins.
        let swing = swing_extreme(&bars, Side::Long, 1).unwrap();
        assert_eq!(swing, dec!(94800));
    }

    #[test]
    fn equal_neighbour_is_not_strict() {
        let bars = bars_from_lows(&[95000, 94800, 94900, 95000, 95100]);
        assert_eq!(swing_extreme(&bars, Side::Long, 1), Some(dec!(94800)));
        // A plateau never qualifies: equality is not strictly below.
        let flat = bars_from_lows(&[95000, 94800, 94800, 94800, 95000]);
        assert_eq!(swing_extreme(&flat, Side::Long, 1), None);
    }

    #[test]
    fn short_uses_highs() {
        let bars: Vec<Bar> = [95000, 95200, 95400, 95100, 95000]
            .iter()
            .map(|h| bar(&h.to_string(), &h.to_string(), &(h - 50).to_string()))
            .collect();
        let swing = swing_extreme(&bars, Side::Short, 2).unwrap();
        assert_eq!(swing, dec!(95400));
    }

    #[test]
    fn window_too_small_yields_none() {
        let bars = bars_from_lows(&[95000, 94800, 95000]);
        assert_eq!(swing_extreme(&bars, Side::Long, 2), None);
    }

    #[test]
    fn desired_stop_applies_buffer() {
        let bars = bars_from_lows(&[95000, 94950, 94800, 94900, 95050]);
        let stop = desired_stop(&bars, Side::Long, 2, dec!(25)).unwrap();
        assert_eq!(stop, dec!(94775));

        let shorts: Vec<Bar> = [95000, 95200, 95400, 95100, 95000]
            .iter()
            .map(|h| bar(&h.to_string(), &h.to_string(), &(h - 50).to_string()))
            .collect();
        let stop = desired_stop(&shorts, Side::Short, 2, dec!(25)).unwrap();
        assert_eq!(stop, dec!(95425));
    }

    #[test]
    fn close_confirmation_buffered() {
        assert!(close_confirms(dec!(95110), dec!(95100), Side::Long, dec!(10)));
        assert!(!close_confirms(dec!(95105), dec!(95100), Side::Long, dec!(10)));
        assert!(close_confirms(dec!(94890), dec!(94900), Side::Short, dec!(10)));
    }

    // --- file-backed reads ---------------------------------------------------

    fn write_feed(rows: &[(&str, &str, &str, &str)]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{BAR_HEADER_V2}").unwrap();
        for (ts, close, hi, low) in rows {
            writeln!(f, "{ts},10,1.5,0.15,0.8,0.7,{close},{close},{hi},{low}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn reads_recent_bars_from_feed() {
        let f = write_feed(&[
            ("2025-01-13T19:58:00Z", "95000", "95050", "94950"),
            ("2025-01-13T19:59:00Z", "94900", "94950", "94800"),
            ("2025-01-13T20:00:00Z", "95000", "95050", "94900"),
        ]);
        let bars = read_recent_bars(f.path(), 10).unwrap().unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[1].low, dec!(94800));
        assert_eq!(bars[2].ts, "2025-01-13T20:00:00Z");
    }

    #[test]
    fn missing_file_fails_closed() {
        let got = read_recent_bars("/nonexistent/feed.csv", 10).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn empty_file_fails_closed() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(read_recent_bars(f.path(), 10).unwrap().is_none());
    }

    #[test]
    fn header_only_fails_closed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{BAR_HEADER_V2}").unwrap();
        f.flush().unwrap();
        assert!(read_recent_bars(f.path(), 10).unwrap().is_none());
    }

    #[test]
    fn schema_mismatch_fails_loud() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "Timestamp,Open,High,Low,Close").unwrap();
        writeln!(f, "2025-01-13T20:00:00Z,1,2,3,4").unwrap();
        f.flush().unwrap();
        assert!(read_recent_bars(f.path(), 10).is_err());
    }
}
