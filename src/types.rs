// =============================================================================
// Shared types used across the nofx trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Side of a perpetual-futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side string used when *entering* a position of this side.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side string used when *exiting* a position of this side.
    pub fn exit_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Account snapshot in quote currency (USDT).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub total_equity: f64,
    pub available_balance: f64,
    pub used_margin: f64,
    /// Used margin as a fraction of total equity, in [0, 1].
    #[serde(default)]
    pub margin_ratio: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub position_count: usize,
}

/// A single open perpetual-futures position as surfaced by the exchange
/// adapter. Quantity is always non-negative; direction lives in `side`.
///
/// `first_observed_at` is engine-assigned the first cycle the position is
/// seen and cleared when it disappears. The exchange's own open time is not
/// trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    #[serde(default)]
    pub unrealized_pnl: f64,
    /// Unrealised PnL as a percentage of the position's margin.
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    #[serde(default)]
    pub liquidation_price: f64,
    #[serde(default)]
    pub margin_used: f64,
    #[serde(default)]
    pub first_observed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Stable key identifying one (symbol, side) position lifetime.
    pub fn key(&self) -> PositionKey {
        PositionKey {
            symbol: self.symbol.clone(),
            side: self.side,
        }
    }

    /// Current return as a percentage of margin, signed by side.
    ///
    /// `((mark - entry) / entry) * leverage * 100` for longs, mirrored for
    /// shorts. Returns 0.0 on a degenerate entry price.
    pub fn leveraged_return_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let raw = (self.mark_price - self.entry_price) / self.entry_price;
        let signed = match self.side {
            PositionSide::Long => raw,
            PositionSide::Short => -raw,
        };
        signed * self.leverage as f64 * 100.0
    }
}

/// Key for per-position engine state (first-observed-at map).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub side: PositionSide,
}

/// Where a candidate symbol was sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTag {
    Default,
    Custom,
    CoinPool,
    OiTop,
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Custom => write!(f, "custom"),
            Self::CoinPool => write!(f, "coin-pool"),
            Self::OiTop => write!(f, "oi-top"),
        }
    }
}

/// A candidate symbol together with the sources that nominated it.
/// The source set is non-empty by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    pub sources: Vec<SourceTag>,
}

impl CandidateCoin {
    pub fn new(symbol: impl Into<String>, source: SourceTag) -> Self {
        Self {
            symbol: symbol.into(),
            sources: vec![source],
        }
    }

    /// Add a source tag if not already present.
    pub fn tag(&mut self, source: SourceTag) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }
}

/// Normalise a symbol upward to `<BASE>USDT` in uppercase.
///
/// Accepts venue-style inputs like `btc/usdt`, `ETH-USDT`, or bare `sol`.
pub fn normalize_symbol(raw: &str) -> String {
    let mut s: String = raw
        .chars()
        .filter(|c| !matches!(c, '/' | '-' | '_' | ' '))
        .collect::<String>()
        .to_uppercase();
    if !s.ends_with("USDT") {
        s.push_str("USDT");
    }
    s
}

/// Whether the symbol falls under the BTC/ETH leverage ceiling.
pub fn is_btc_eth(symbol: &str) -> bool {
    matches!(symbol, "BTCUSDT" | "ETHUSDT")
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_variants() {
        assert_eq!(normalize_symbol("btc/usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("ETH-USDT"), "ETHUSDT");
        assert_eq!(normalize_symbol("sol"), "SOLUSDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn btc_eth_classification() {
        assert!(is_btc_eth("BTCUSDT"));
        assert!(is_btc_eth("ETHUSDT"));
        assert!(!is_btc_eth("SOLUSDT"));
    }

    #[test]
    fn leveraged_return_long_and_short() {
        let mut pos = Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: 100.0,
            mark_price: 105.0,
            quantity: 1.0,
            leverage: 10,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            margin_used: 10.0,
            first_observed_at: None,
        };
        // +5% price move at 10x = +50%
        assert!((pos.leveraged_return_pct() - 50.0).abs() < 1e-9);

        pos.side = PositionSide::Short;
        assert!((pos.leveraged_return_pct() + 50.0).abs() < 1e-9);
    }

    #[test]
    fn leveraged_return_degenerate_entry() {
        let pos = Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: 0.0,
            mark_price: 100.0,
            quantity: 1.0,
            leverage: 5,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            margin_used: 0.0,
            first_observed_at: None,
        };
        assert_eq!(pos.leveraged_return_pct(), 0.0);
    }

    #[test]
    fn candidate_tags_dedup() {
        let mut c = CandidateCoin::new("BTCUSDT", SourceTag::Default);
        c.tag(SourceTag::CoinPool);
        c.tag(SourceTag::CoinPool);
        assert_eq!(c.sources, vec![SourceTag::Default, SourceTag::CoinPool]);
    }

    #[test]
    fn side_order_strings() {
        assert_eq!(PositionSide::Long.entry_order_side(), "BUY");
        assert_eq!(PositionSide::Long.exit_order_side(), "SELL");
        assert_eq!(PositionSide::Short.entry_order_side(), "SELL");
        assert_eq!(PositionSide::Short.exit_order_side(), "BUY");
    }
}
