// =============================================================================
// Decision Model — typed actions out of the LLM edge
// =============================================================================
//
// The LLM returns free text that must end up as typed decisions. The wire
// shape is a separate DTO (`parse::RawDecision`); the validator reifies DTOs
// into `Decision` values. Execution order within a cycle is governed by the
// priority ranks below, never by the LLM-supplied order across ranks.
// =============================================================================

pub mod parse;
pub mod validator;

use serde::{Deserialize, Serialize};

/// The nine-action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    UpdateStopLoss,
    UpdateTakeProfit,
    PartialClose,
    Hold,
    Wait,
}

impl Action {
    /// Parse a wire action string. Accepts `snake_case` and `kebab-case`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open_long" => Some(Self::OpenLong),
            "open_short" => Some(Self::OpenShort),
            "close_long" => Some(Self::CloseLong),
            "close_short" => Some(Self::CloseShort),
            "update_stop_loss" => Some(Self::UpdateStopLoss),
            "update_take_profit" => Some(Self::UpdateTakeProfit),
            "partial_close" => Some(Self::PartialClose),
            "hold" => Some(Self::Hold),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
            Self::UpdateStopLoss => "update_stop_loss",
            Self::UpdateTakeProfit => "update_take_profit",
            Self::PartialClose => "partial_close",
            Self::Hold => "hold",
            Self::Wait => "wait",
        }
    }

    /// Execution rank, ascending. Freeing margin and rewriting protection
    /// orders before opening new exposure prevents a valid swap from being
    /// rejected for transient margin insufficiency.
    pub fn priority(&self) -> u8 {
        match self {
            Self::CloseLong | Self::CloseShort | Self::PartialClose => 1,
            Self::UpdateStopLoss | Self::UpdateTakeProfit => 2,
            Self::OpenLong | Self::OpenShort => 3,
            Self::Hold | Self::Wait => 4,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated decision ready for the execution sequencer.
///
/// Numeric fields are `None` when the wire omitted them; the validator has
/// already guaranteed presence for the fields the action requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub leverage: Option<u32>,
    /// Quote-currency notional (`quantity × price`), not margin.
    #[serde(default)]
    pub position_size_usd: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub new_stop_loss: Option<f64>,
    #[serde(default)]
    pub new_take_profit: Option<f64>,
    #[serde(default)]
    pub close_percentage: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

/// Stable priority ordering: within a rank the LLM-provided order is kept.
pub fn sort_by_priority(decisions: &mut [Decision]) {
    decisions.sort_by_key(|d| d.action.priority());
}
