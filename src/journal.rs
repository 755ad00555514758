// =============================================================================
// Decision Journal — append-only per-trader record of each cycle
// =============================================================================
//
// One directory per trader under the log root, one JSON record per cycle,
// filename embedding the UTC timestamp and cycle number so lexical order is
// chronological order. Records are written atomically (tmp + rename) and are
// self-describing: prompt, raw LLM output, decisions, and per-action results
// make post-hoc diagnosis offline-reproducible.
//
// Persistence failures are logged but never block the cycle. No deletion.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decision::parse::RawDecision;
use crate::types::{AccountState, CandidateCoin, Position};

/// Default directory when no override applies.
const DEFAULT_LOG_DIR: &str = "decision_logs";

/// Cycles folded into the performance summary by default.
pub const DEFAULT_SUMMARY_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Outcome of one executed (or attempted) action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub order_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Immutable record of one full cycle, written once at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub account: AccountState,
    pub positions: Vec<Position>,
    pub candidates: Vec<CandidateCoin>,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Full raw LLM response, chain-of-thought included.
    pub chain_of_thought: String,
    /// Decision list as received, after JSON repair.
    pub decisions: Vec<RawDecision>,
    pub actions: Vec<ActionRecord>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Compact performance figure over the last N cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub cycles: usize,
    pub total_actions: usize,
    pub successful_actions: usize,
    pub failed_actions: usize,
    pub open_actions: usize,
    pub close_actions: usize,
    /// Successful fraction of executed actions, in [0, 1].
    pub action_success_rate: f64,
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only sink keyed by trader id. Thread-safe: every write lands in a
/// fresh file, so concurrent traders never contend.
pub struct Journal {
    root: PathBuf,
}

impl Journal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the log root: `NOFX_LOG_DIR` when set; `/data/decision_logs`
    /// when `/data` is writable; `decision_logs` otherwise.
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("NOFX_LOG_DIR") {
            if !dir.trim().is_empty() {
                return Self::new(dir);
            }
        }
        let data = Path::new("/data");
        if data.is_dir()
            && std::fs::metadata(data)
                .map(|m| !m.permissions().readonly())
                .unwrap_or(false)
        {
            return Self::new("/data/decision_logs");
        }
        Self::new(DEFAULT_LOG_DIR)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn trader_dir(&self, trader_id: &str) -> PathBuf {
        self.root.join(trader_id)
    }

    fn record_filename(record: &CycleRecord) -> String {
        format!(
            "{}_cycle{:06}.json",
            record.started_at.format("%Y%m%dT%H%M%SZ"),
            record.cycle_number
        )
    }

    /// Append one cycle record atomically (write tmp, then rename).
    pub fn append(&self, trader_id: &str, record: &CycleRecord) -> Result<()> {
        let dir = self.trader_dir(trader_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;

        let path = dir.join(Self::record_filename(record));
        let content = serde_json::to_string_pretty(record)
            .context("failed to serialise cycle record to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp record to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp record to {}", path.display()))?;

        debug!(
            trader_id,
            cycle = record.cycle_number,
            path = %path.display(),
            "cycle record journaled"
        );
        Ok(())
    }

    /// Most recent `count` records, ordered oldest-first. Corrupt files are
    /// skipped with a warning.
    pub fn recent(&self, trader_id: &str, count: usize) -> Vec<CycleRecord> {
        let dir = self.trader_dir(trader_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        files.sort();

        let start = files.len().saturating_sub(count);
        files[start..]
            .iter()
            .filter_map(|path| match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<CycleRecord>(&content) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping corrupt cycle record");
                        None
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable cycle record");
                    None
                }
            })
            .collect()
    }

    /// The highest cycle number on disk, if any. The engine resumes from the
    /// next one so cycle numbers stay contiguous across restarts.
    pub fn last_cycle_number(&self, trader_id: &str) -> Option<u64> {
        self.recent(trader_id, 1).last().map(|r| r.cycle_number)
    }

    /// Fold the last `window` cycles into a performance figure.
    pub fn performance_summary(&self, trader_id: &str, window: usize) -> PerformanceSummary {
        let records = self.recent(trader_id, window);

        let mut summary = PerformanceSummary {
            cycles: records.len(),
            ..PerformanceSummary::default()
        };

        for record in &records {
            for action in &record.actions {
                summary.total_actions += 1;
                if action.success {
                    summary.successful_actions += 1;
                } else {
                    summary.failed_actions += 1;
                }
                if action.action.starts_with("open_") {
                    summary.open_actions += 1;
                } else if action.action.starts_with("close_") || action.action == "partial_close" {
                    summary.close_actions += 1;
                }
            }
        }

        summary.action_success_rate = if summary.total_actions > 0 {
            summary.successful_actions as f64 / summary.total_actions as f64
        } else {
            0.0
        };

        summary
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(cycle: u64, minute: u32) -> CycleRecord {
        CycleRecord {
            cycle_number: cycle,
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            account: AccountState::default(),
            positions: Vec::new(),
            candidates: Vec::new(),
            system_prompt: "sys".to_string(),
            user_prompt: "user".to_string(),
            chain_of_thought: "thinking".to_string(),
            decisions: Vec::new(),
            actions: vec![ActionRecord {
                action: if cycle % 2 == 0 { "open_long" } else { "wait" }.to_string(),
                symbol: "BTCUSDT".to_string(),
                quantity: 0.01,
                leverage: 10,
                price: 60000.0,
                order_id: Some("42".to_string()),
                success: cycle % 3 != 0,
                error: None,
            }],
            success: true,
            error: None,
        }
    }

    #[test]
    fn append_then_recent_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());

        for i in 1..=5 {
            journal.append("t1", &record(i, i as u32)).unwrap();
        }

        let recent = journal.recent("t1", 3);
        assert_eq!(recent.len(), 3);
        // Oldest-first ordering of the most recent three.
        let numbers: Vec<u64> = recent.iter().map(|r| r.cycle_number).collect();
        assert_eq!(numbers, vec![3, 4, 5]);
    }

    #[test]
    fn recent_on_unknown_trader_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        assert!(journal.recent("nobody", 10).is_empty());
    }

    #[test]
    fn corrupt_record_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        journal.append("t1", &record(1, 1)).unwrap();

        // Drop a corrupt file that sorts after the valid record.
        let trader_dir = dir.path().join("t1");
        std::fs::write(trader_dir.join("99999999T999999Z_cycle999999.json"), "{oops").unwrap();

        let recent = journal.recent("t1", 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].cycle_number, 1);
    }

    #[test]
    fn last_cycle_number_tracks_max() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        assert_eq!(journal.last_cycle_number("t1"), None);
        journal.append("t1", &record(7, 1)).unwrap();
        journal.append("t1", &record(8, 2)).unwrap();
        assert_eq!(journal.last_cycle_number("t1"), Some(8));
    }

    #[test]
    fn performance_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        for i in 1..=6 {
            journal.append("t1", &record(i, i as u32)).unwrap();
        }

        let summary = journal.performance_summary("t1", 100);
        assert_eq!(summary.cycles, 6);
        assert_eq!(summary.total_actions, 6);
        // Cycles 3 and 6 carry failed actions.
        assert_eq!(summary.failed_actions, 2);
        assert_eq!(summary.successful_actions, 4);
        assert!((summary.action_success_rate - 4.0 / 6.0).abs() < 1e-9);
        // Even cycles opened positions.
        assert_eq!(summary.open_actions, 3);
    }

    #[test]
    fn traders_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        journal.append("alpha", &record(1, 1)).unwrap();
        journal.append("beta", &record(1, 2)).unwrap();
        assert_eq!(journal.recent("alpha", 10).len(), 1);
        assert_eq!(journal.recent("beta", 10).len(), 1);
    }
}
