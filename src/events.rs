// =============================================================================
// Event log — structured JSONL output plus best-effort webhook shipping
// =============================================================================
//
// Every observable state transition becomes one JSON line:
//   {"ts":"...","source":"executor","action":"TP1_DONE", ...context}
//
// The log is capped by append-then-cap rotation at `LOG_MAX_LINES`. Webhook
// delivery is telemetry: failures are logged and dropped, never retried.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Webhook target with basic-auth credentials.
#[derive(Clone)]
pub struct Webhook {
    pub url: String,
    pub user: String,
    pub pass: String,
}

/// Sink for executor events and trade reports.
pub struct EventLog {
    path: PathBuf,
    reports_path: PathBuf,
    max_lines: usize,
    webhook: Option<Webhook>,
    http: reqwest::Client,
    // Serializes append-then-cap cycles; the tick is single-threaded but the
    // webhook tasks clone the sink handle.
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(
        path: impl Into<PathBuf>,
        reports_path: impl Into<PathBuf>,
        max_lines: usize,
        webhook: Option<Webhook>,
    ) -> Self {
        Self {
            path: path.into(),
            reports_path: reports_path.into(),
            max_lines,
            webhook,
            http: reqwest::Client::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Emit one event line. `action` is the uppercase event name; `context`
    /// must be a JSON object (its fields are merged into the line).
    pub fn emit(&self, action: &str, context: Value) {
        let line = build_line(action, context);

        info!(action, "event");
        if let Err(e) = self.append_capped(&line) {
            warn!(error = %e, action, "failed to write event log line");
        }

        self.ship(line);
    }

    /// Append a trade report line. Reports are never capped — they are the
    /// durable record of closed trades.
    pub fn report(&self, action: &str, context: Value) {
        let line = build_line(action, context);
        let _guard = self.write_lock.lock();
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.reports_path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = res {
            warn!(error = %e, action, "failed to write trade report line");
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn append_capped(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{line}")?;
        drop(f);

        // Cap: rewrite with only the newest `max_lines` lines when exceeded.
        let content = std::fs::read_to_string(&self.path)?;
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() > self.max_lines {
            let keep = &lines[lines.len() - self.max_lines..];
            let tmp = self.path.with_extension("jsonl.tmp");
            std::fs::write(&tmp, keep.join("\n") + "\n")?;
            std::fs::rename(&tmp, &self.path)?;
        }
        Ok(())
    }

    /// Fire-and-forget webhook POST. Spawned so the tick never blocks on
    /// telemetry.
    fn ship(&self, line: String) {
        let Some(hook) = self.webhook.clone() else {
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let req = http
                .post(&hook.url)
                .basic_auth(&hook.user, Some(&hook.pass))
                .header("Content-Type", "application/json")
                .body(line);
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("webhook delivered");
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), "webhook rejected");
                }
                Err(e) => {
                    warn!(error = %e, "webhook delivery failed");
                }
            }
        });
    }
}

fn build_line(action: &str, context: Value) -> String {
    let mut obj = json!({
        "ts": Utc::now().to_rfc3339(),
        "source": "executor",
        "action": action,
    });
    if let (Some(base), Some(extra)) = (obj.as_object_mut(), context.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    obj.to_string()
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.path)
            .field("max_lines", &self.max_lines)
            .field("webhook", &self.webhook.as_ref().map(|w| w.url.as_str()))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(max_lines: usize) -> (EventLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(
            dir.path().join("events.jsonl"),
            dir.path().join("reports.jsonl"),
            max_lines,
            None,
        );
        (log, dir)
    }

    #[test]
    fn line_has_mandatory_fields() {
        let line = build_line("ENTRY_PLACED", json!({"price": "95000.5"}));
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["source"], "executor");
        assert_eq!(v["action"], "ENTRY_PLACED");
        assert_eq!(v["price"], "95000.5");
        assert!(v["ts"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn append_then_cap_keeps_newest() {
        let (log, dir) = sink(5);
        for i in 0..12 {
            log.emit("TICK", json!({ "seq": i }));
        }
        let content = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        let last: Value = serde_json::from_str(lines[4]).unwrap();
        assert_eq!(first["seq"], 7);
        assert_eq!(last["seq"], 11);
    }

    #[test]
    fn reports_are_never_capped() {
        let (log, dir) = sink(2);
        for i in 0..6 {
            log.report("TRADE_CLOSED", json!({ "seq": i }));
        }
        let content = std::fs::read_to_string(dir.path().join("reports.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 6);
    }
}
