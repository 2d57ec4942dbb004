// =============================================================================
// Atomic state store — one JSON document, temp-file + rename persistence
// =============================================================================
//
// Load policy: a missing file is an empty state (first boot); a malformed
// file is fatal — silently starting from scratch over a corrupt document
// would duplicate a live position.
//
// Save policy: write a sibling temp file, then atomically rename it over the
// canonical path. Save returns a boolean; a failed save must NOT halt the
// process (a market order may have just executed externally) — the caller
// alerts the operator once and keeps running.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::dedup::SeenKeys;
use crate::margin::MarginLedger;
use crate::position::{LastClosed, Position};

/// The single persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotState {
    /// The one tracked position, or `None` between trades.
    #[serde(default)]
    pub position: Option<Position>,

    /// Recently seen dedup keys plus their algorithm fingerprint.
    #[serde(default)]
    pub seen_keys: SeenKeys,

    /// Per-trade borrow bookkeeping.
    #[serde(default)]
    pub margin: MarginLedger,

    /// Terminal snapshot of the previous position.
    #[serde(default)]
    pub last_closed: Option<LastClosed>,

    /// No new entries before this time (epoch seconds).
    #[serde(default)]
    pub cooldown_until_s: u64,

    /// Duplicate-open lock set when an entry is placed.
    #[serde(default)]
    pub lock_until_s: u64,

    /// Sleep mode: set by the emergency shutdown, cleared by the wake flag.
    #[serde(default)]
    pub sleeping: bool,
}

/// Handle for the canonical state path and its emergency backup.
pub struct StateStore {
    path: PathBuf,
    backup_path: PathBuf,
    fail_alerted: bool,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_path: backup_path.into(),
            fail_alerted: false,
        }
    }

    /// Load the state document. Missing file → default state; malformed
    /// file → fatal error.
    pub fn load(&self) -> Result<BotState> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no state file — starting empty");
            return Ok(BotState::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state from {}", self.path.display()))?;
        let state: BotState = serde_json::from_str(&content)
            .with_context(|| format!("malformed state file {}", self.path.display()))?;
        info!(
            path = %self.path.display(),
            has_position = state.position.is_some(),
            seen_keys = state.seen_keys.len(),
            "state loaded"
        );
        Ok(state)
    }

    /// Persist atomically. Returns `true` on success; callers must check.
    pub fn save(&self, state: &BotState) -> bool {
        match self.write_atomic(&self.path, state) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "state save failed");
                false
            }
        }
    }

    /// Persist to the emergency backup path (used when the primary save
    /// fails during shutdown).
    pub fn save_backup(&self, state: &BotState) -> bool {
        match self.write_atomic(&self.backup_path, state) {
            Ok(()) => {
                warn!(path = %self.backup_path.display(), "state written to emergency backup");
                true
            }
            Err(e) => {
                error!(error = %e, path = %self.backup_path.display(), "backup state save failed");
                false
            }
        }
    }

    /// One-shot gate for the save-failure alert: true only on the first
    /// failure since the last success.
    pub fn first_failure(&mut self) -> bool {
        if self.fail_alerted {
            false
        } else {
            self.fail_alerted = true;
            true
        }
    }

    pub fn clear_failure(&mut self) {
        self.fail_alerted = false;
    }

    fn write_atomic(&self, path: &Path, state: &BotState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).context("failed to serialise state to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("backup_path", &self.backup_path)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
