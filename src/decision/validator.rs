// =============================================================================
// Decision Validator — structural + hard-risk checks on the LLM's output
// =============================================================================
//
// Validation is per-decision and order-independent; one rejection rejects the
// whole list and no action is executed. Economic checks (risk/reward,
// liquidation proximity, fee budget) are deliberately NOT re-enforced here —
// they live in the adapter's pre-placement sanity so the two layers cannot
// disagree.
//
// Omitted / null numeric fields are unset, not zero; a field is only required
// when the action needs it.
// =============================================================================

use crate::decision::parse::RawDecision;
use crate::decision::{Action, Decision};
use crate::types::{is_btc_eth, normalize_symbol};

/// Leverage ceilings from the trader configuration.
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
}

impl RiskLimits {
    pub fn ceiling_for(&self, symbol: &str) -> u32 {
        if is_btc_eth(symbol) {
            self.btc_eth_leverage
        } else {
            self.altcoin_leverage
        }
    }
}

/// A structural rejection; `index` is the decision's position in the list.
#[derive(Debug, Clone, thiserror::Error)]
#[error("decision {index} ({action}): {reason}")]
pub struct ValidationError {
    pub index: usize,
    pub action: String,
    pub reason: String,
}

/// Validate the whole list and reify it into typed decisions.
///
/// Pure: the same input always produces the same output, and re-validating
/// an accepted list is a no-op.
pub fn validate_decisions(
    raw: &[RawDecision],
    limits: &RiskLimits,
) -> Result<Vec<Decision>, ValidationError> {
    raw.iter()
        .enumerate()
        .map(|(index, r)| validate_one(index, r, limits))
        .collect()
}

fn validate_one(
    index: usize,
    raw: &RawDecision,
    limits: &RiskLimits,
) -> Result<Decision, ValidationError> {
    let reject = |reason: String| ValidationError {
        index,
        action: raw.action.clone(),
        reason,
    };

    let action = Action::parse(&raw.action)
        .ok_or_else(|| reject(format!("unknown action '{}'", raw.action)))?;

    let symbol = if raw.symbol.trim().is_empty() {
        String::new()
    } else {
        normalize_symbol(&raw.symbol)
    };

    match action {
        Action::OpenLong | Action::OpenShort => {
            if symbol.is_empty() {
                return Err(reject("open action requires a symbol".to_string()));
            }

            let leverage_raw = raw
                .leverage
                .ok_or_else(|| reject("open action requires leverage".to_string()))?;
            if leverage_raw.fract() != 0.0 {
                return Err(reject(format!("leverage {leverage_raw} must be an integer")));
            }
            let leverage = leverage_raw as i64;
            let ceiling = limits.ceiling_for(&symbol);
            if leverage < 1 || leverage > ceiling as i64 {
                return Err(reject(format!(
                    "leverage {leverage} outside allowed range 1..={ceiling} for {symbol}"
                )));
            }

            let notional = raw
                .position_size_usd
                .ok_or_else(|| reject("open action requires position_size_usd".to_string()))?;
            if notional <= 0.0 {
                return Err(reject(format!(
                    "position_size_usd {notional} must be positive"
                )));
            }
        }
        Action::UpdateStopLoss => {
            if symbol.is_empty() {
                return Err(reject("update_stop_loss requires a symbol".to_string()));
            }
            let price = raw
                .new_stop_loss
                .ok_or_else(|| reject("update_stop_loss requires new_stop_loss".to_string()))?;
            if price <= 0.0 {
                return Err(reject(format!("new_stop_loss {price} must be positive")));
            }
        }
        Action::UpdateTakeProfit => {
            if symbol.is_empty() {
                return Err(reject("update_take_profit requires a symbol".to_string()));
            }
            let price = raw
                .new_take_profit
                .ok_or_else(|| reject("update_take_profit requires new_take_profit".to_string()))?;
            if price <= 0.0 {
                return Err(reject(format!("new_take_profit {price} must be positive")));
            }
        }
        Action::PartialClose => {
            if symbol.is_empty() {
                return Err(reject("partial_close requires a symbol".to_string()));
            }
            let pct = raw
                .close_percentage
                .ok_or_else(|| reject("partial_close requires close_percentage".to_string()))?;
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(reject(format!(
                    "close_percentage {pct} outside (0, 100]"
                )));
            }
        }
        Action::CloseLong | Action::CloseShort => {
            if symbol.is_empty() {
                return Err(reject("close action requires a symbol".to_string()));
            }
        }
        Action::Hold | Action::Wait => {}
    }

    Ok(Decision {
        action,
        symbol,
        leverage: raw.leverage.map(|l| l as u32),
        position_size_usd: raw.position_size_usd,
        stop_loss: raw.stop_loss,
        take_profit: raw.take_profit,
        new_stop_loss: raw.new_stop_loss,
        new_take_profit: raw.new_take_profit,
        close_percentage: raw.close_percentage,
        confidence: raw.confidence,
        risk_usd: raw.risk_usd,
        reasoning: raw.reasoning.clone(),
    })
}
