// =============================================================================
// Trader Configuration — per-instance records and the configuration store
// =============================================================================
//
// Every field carries a serde default so that adding new fields never breaks
// loading an older config file. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash.
//
// The engine treats the store as read-mostly: it loads configs at creation,
// resolves prompt templates by name, and calls back exactly once per balance
// auto-sync to persist a corrected initial balance.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm::Dialect;
use crate::prompt;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_scan_interval_secs() -> u64 {
    180
}

fn default_leverage() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    "default".to_string()
}

// =============================================================================
// Profiles
// =============================================================================

/// LLM backend credentials and model selection for one trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProfile {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    /// Base-URL override; `None` uses the provider default.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub dialect: Dialect,
    /// Sticky thread id for the assistant dialect, preserving context across
    /// calls.
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Exchange venue credentials for one trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeProfile {
    pub venue: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
    /// Cross vs isolated margin.
    #[serde(default = "default_true")]
    pub cross_margin: bool,
}

/// Which venue figure replaces the declared initial balance on auto-sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceSyncBasis {
    /// Treat the initial balance as working capital (venue available balance).
    Available,
    Equity,
}

impl Default for BalanceSyncBasis {
    fn default() -> Self {
        Self::Available
    }
}

// =============================================================================
// TraderConfig
// =============================================================================

/// Immutable per-instance trader record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Stable identifier.
    pub id: String,
    pub name: String,

    pub llm: LlmProfile,
    pub exchange: ExchangeProfile,

    /// Cycle period; strictly positive.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Declared initial balance in USDT; strictly positive at all times.
    pub initial_balance: f64,

    /// Leverage ceiling for BTCUSDT / ETHUSDT.
    #[serde(default = "default_leverage")]
    pub btc_eth_leverage: u32,

    /// Leverage ceiling for everything else.
    #[serde(default = "default_leverage")]
    pub altcoin_leverage: u32,

    /// Candidate symbols; empty means "use signal sources".
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default = "default_template")]
    pub prompt_template: String,

    /// Optional user-supplied overlay appended to the template.
    #[serde(default)]
    pub prompt_overlay: Option<String>,

    #[serde(default = "default_true")]
    pub use_coin_pool: bool,

    #[serde(default = "default_true")]
    pub use_oi_top: bool,

    #[serde(default)]
    pub balance_sync_basis: BalanceSyncBasis,
}

impl TraderConfig {
    /// Structural sanity; rejected configs never reach the engine.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("trader id must not be empty");
        }
        if self.scan_interval_secs == 0 {
            bail!("scan interval must be positive");
        }
        if self.initial_balance <= 0.0 {
            bail!("initial balance must be strictly positive");
        }
        if self.btc_eth_leverage == 0 || self.altcoin_leverage == 0 {
            bail!("leverage ceilings must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Environment overrides
// =============================================================================

/// Configuration-store path from `NOFX_DB_PATH`.
pub fn db_path() -> PathBuf {
    std::env::var("NOFX_DB_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("traders.json"))
}

/// IANA timezone from `NOFX_TIMEZONE`, used only for user-prompt timestamp
/// formatting. Defaults to `Asia/Shanghai`; an unknown name falls back with
/// a warning.
pub fn display_timezone() -> chrono_tz::Tz {
    let name = std::env::var("NOFX_TIMEZONE").unwrap_or_else(|_| "Asia/Shanghai".to_string());
    match name.parse::<chrono_tz::Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(zone = %name, "unknown NOFX_TIMEZONE — falling back to Asia/Shanghai");
            chrono_tz::Asia::Shanghai
        }
    }
}

// =============================================================================
// Configuration store
// =============================================================================

/// External collaborator: supplies trader configs, accepts balance
/// corrections, and resolves prompt-template bodies by name.
pub trait ConfigStore: Send + Sync {
    fn load_traders(&self) -> Result<Vec<TraderConfig>>;

    /// Persist a corrected initial balance detected by balance auto-sync.
    fn persist_initial_balance(&self, trader_id: &str, new_balance: f64) -> Result<()>;

    /// Template body by name; `None` when unknown.
    fn prompt_template(&self, name: &str) -> Option<String>;
}

/// JSON-file-backed store. The whole trader list lives in one file written
/// atomically; prompt templates resolve from the built-in set.
pub struct FileConfigStore {
    path: PathBuf,
    traders: RwLock<Vec<TraderConfig>>,
}

impl FileConfigStore {
    /// Load from `path`; a missing file yields an empty trader set.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let traders = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read trader config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse trader config from {}", path.display()))?
        } else {
            warn!(path = %path.display(), "trader config file missing — starting empty");
            Vec::new()
        };

        info!(path = %path.display(), traders = traders.len(), "trader config loaded");
        Ok(Self {
            path,
            traders: RwLock::new(traders),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::open(db_path())
    }

    /// Atomic write: tmp sibling, then rename.
    fn save_locked(&self, traders: &[TraderConfig]) -> Result<()> {
        let content = serde_json::to_string_pretty(traders)
            .context("failed to serialise trader configs to JSON")?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp config to {}", self.path.display()))?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn load_traders(&self) -> Result<Vec<TraderConfig>> {
        Ok(self.traders.read().clone())
    }

    fn persist_initial_balance(&self, trader_id: &str, new_balance: f64) -> Result<()> {
        let mut traders = self.traders.write();
        let Some(config) = traders.iter_mut().find(|t| t.id == trader_id) else {
            bail!("unknown trader id {trader_id}");
        };
        let old = config.initial_balance;
        config.initial_balance = new_balance;
        self.save_locked(&traders)?;
        info!(
            trader_id,
            old_balance = old,
            new_balance,
            "initial balance correction persisted"
        );
        Ok(())
    }

    fn prompt_template(&self, name: &str) -> Option<String> {
        prompt::builtin_template(name).map(|s| s.to_string())
    }
}
