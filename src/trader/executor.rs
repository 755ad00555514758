// =============================================================================
// Execution Sequencer — orders and performs the validated decision list
// =============================================================================
//
// Actions run serially in ascending priority rank: closes and partial closes
// free margin first, protection updates second, opens third, hold/wait last.
// The sort is stable, so within a rank the LLM-provided order is preserved.
// A failed action is recorded and logged but never aborts the rest of the
// list.
//
// The sequencer does not duplicate the adapter's precision rounding or
// pre-placement sanity; those live in one place so the two layers cannot
// disagree.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::decision::{sort_by_priority, Action, Decision};
use crate::exchange::{Exchange, OpenRequest};
use crate::journal::ActionRecord;
use crate::types::{PositionKey, PositionSide};

/// Map of engine-assigned first-observed timestamps, keyed per position
/// lifetime.
pub type FirstObservedMap = HashMap<PositionKey, DateTime<Utc>>;

/// Executes validated decisions against the exchange adapter.
pub struct ExecutionSequencer {
    exchange: Arc<dyn Exchange>,
    cross_margin: bool,
}

impl ExecutionSequencer {
    pub fn new(exchange: Arc<dyn Exchange>, cross_margin: bool) -> Self {
        Self {
            exchange,
            cross_margin,
        }
    }

    /// Execute the whole list in priority order and return one record per
    /// action, in execution order.
    pub async fn execute_all(
        &self,
        mut decisions: Vec<Decision>,
        first_observed: &mut FirstObservedMap,
    ) -> Vec<ActionRecord> {
        sort_by_priority(&mut decisions);

        let mut records = Vec::with_capacity(decisions.len());
        for decision in &decisions {
            let record = self.execute_one(decision, first_observed).await;
            if let Some(error) = &record.error {
                warn!(
                    action = %record.action,
                    symbol = %record.symbol,
                    error = %error,
                    "action failed"
                );
            } else {
                info!(
                    action = %record.action,
                    symbol = %record.symbol,
                    quantity = record.quantity,
                    "action executed"
                );
            }
            records.push(record);
        }
        records
    }

    async fn execute_one(
        &self,
        decision: &Decision,
        first_observed: &mut FirstObservedMap,
    ) -> ActionRecord {
        match decision.action {
            Action::OpenLong => {
                self.open_action(decision, PositionSide::Long, first_observed)
                    .await
            }
            Action::OpenShort => {
                self.open_action(decision, PositionSide::Short, first_observed)
                    .await
            }
            Action::CloseLong => {
                self.close_action(decision, PositionSide::Long, first_observed)
                    .await
            }
            Action::CloseShort => {
                self.close_action(decision, PositionSide::Short, first_observed)
                    .await
            }
            Action::UpdateStopLoss => self.update_protection(decision, true).await,
            Action::UpdateTakeProfit => self.update_protection(decision, false).await,
            Action::PartialClose => self.partial_close(decision).await,
            Action::Hold | Action::Wait => ActionRecord {
                action: decision.action.as_str().to_string(),
                symbol: decision.symbol.clone(),
                quantity: 0.0,
                leverage: 0,
                price: 0.0,
                order_id: None,
                success: true,
                error: None,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    async fn open_action(
        &self,
        decision: &Decision,
        side: PositionSide,
        first_observed: &mut FirstObservedMap,
    ) -> ActionRecord {
        let symbol = decision.symbol.clone();
        let leverage = decision.leverage.unwrap_or(1);
        // The validator guarantees presence of the notional for opens.
        let notional = decision.position_size_usd.unwrap_or(0.0);

        let mut record = ActionRecord {
            action: decision.action.as_str().to_string(),
            symbol: symbol.clone(),
            quantity: 0.0,
            leverage,
            price: 0.0,
            order_id: None,
            success: false,
            error: None,
        };

        let mark = match self.exchange.get_mark_price(&symbol).await {
            Ok(p) => p,
            Err(e) => {
                record.error = Some(format!("mark price lookup failed: {e}"));
                return record;
            }
        };
        if mark <= 0.0 {
            record.error = Some(format!("degenerate mark price {mark}"));
            return record;
        }
        let quantity = notional / mark;

        if let Err(e) = self.exchange.set_margin_mode(&symbol, self.cross_margin).await {
            record.error = Some(format!("set margin mode failed: {e}"));
            return record;
        }
        if let Err(e) = self
            .exchange
            .set_leverage(&symbol, Some(side), leverage)
            .await
        {
            record.error = Some(format!("set leverage failed: {e}"));
            return record;
        }

        let request = OpenRequest {
            symbol: symbol.clone(),
            side,
            quantity,
            leverage,
            stop_loss: decision.stop_loss,
            take_profit: decision.take_profit,
        };

        match self.exchange.open(&request).await {
            Ok(fill) => {
                first_observed.insert(
                    PositionKey {
                        symbol: symbol.clone(),
                        side,
                    },
                    Utc::now(),
                );
                record.quantity = fill.executed_qty;
                record.price = fill.avg_price;
                record.order_id = Some(fill.order_id);
                record.success = true;
            }
            Err(e) => record.error = Some(e.to_string()),
        }
        record
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    async fn close_action(
        &self,
        decision: &Decision,
        side: PositionSide,
        first_observed: &mut FirstObservedMap,
    ) -> ActionRecord {
        let symbol = decision.symbol.clone();
        let mut record = ActionRecord {
            action: decision.action.as_str().to_string(),
            symbol: symbol.clone(),
            quantity: 0.0,
            leverage: 0,
            price: 0.0,
            order_id: None,
            success: false,
            error: None,
        };

        // Quantity 0 lets the adapter resolve the full position.
        match self.exchange.close(&symbol, side, 0.0).await {
            Ok(fill) => {
                record.quantity = fill.executed_qty;
                record.price = fill.avg_price;
                record.order_id = Some(fill.order_id);
                record.success = true;

                first_observed.remove(&PositionKey {
                    symbol: symbol.clone(),
                    side,
                });

                // Residual protection orders would otherwise fire into a flat
                // book; scrubbing them is part of the close.
                if let Err(e) = self.exchange.cancel_all_open_orders(&symbol).await {
                    warn!(symbol = %symbol, error = %e, "residual order cleanup failed");
                }
            }
            Err(e) => record.error = Some(e.to_string()),
        }
        record
    }

    // -------------------------------------------------------------------------
    // Protection updates
    // -------------------------------------------------------------------------

    async fn update_protection(&self, decision: &Decision, is_stop: bool) -> ActionRecord {
        let symbol = decision.symbol.clone();
        let new_price = if is_stop {
            decision.new_stop_loss.unwrap_or(0.0)
        } else {
            decision.new_take_profit.unwrap_or(0.0)
        };

        let mut record = ActionRecord {
            action: decision.action.as_str().to_string(),
            symbol: symbol.clone(),
            quantity: 0.0,
            leverage: 0,
            price: new_price,
            order_id: None,
            success: false,
            error: None,
        };

        let positions = match self.exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                record.error = Some(format!("position lookup failed: {e}"));
                return record;
            }
        };

        let matching: Vec<_> = positions.iter().filter(|p| p.symbol == symbol).collect();
        let Some(position) = matching.first() else {
            record.error = Some(format!("no open position for {symbol}"));
            return record;
        };

        if matching.len() > 1 {
            // Should never exist under the one-position-per-symbol rules, but
            // hedge-mode venues can produce it. Cancellations below stay
            // symbol-scoped, so this is diagnostic, not a safety issue.
            warn!(
                symbol = %symbol,
                sides = ?matching.iter().map(|p| p.side).collect::<Vec<_>>(),
                "OPPOSITE-SIDE POSITIONS for one symbol during protection update"
            );
        }

        let cancel_result = if is_stop {
            self.exchange.cancel_stop_loss(&symbol).await
        } else {
            self.exchange.cancel_take_profit(&symbol).await
        };
        if let Err(e) = cancel_result {
            record.error = Some(format!("cancel failed: {e}"));
            return record;
        }

        let place_result = if is_stop {
            self.exchange
                .set_stop_loss(&symbol, position.side, position.quantity, new_price)
                .await
        } else {
            self.exchange
                .set_take_profit(&symbol, position.side, position.quantity, new_price)
                .await
        };

        match place_result {
            Ok(()) => {
                record.quantity = position.quantity;
                record.success = true;
            }
            Err(e) => record.error = Some(e.to_string()),
        }
        record
    }

    // -------------------------------------------------------------------------
    // Partial close
    // -------------------------------------------------------------------------

    async fn partial_close(&self, decision: &Decision) -> ActionRecord {
        let symbol = decision.symbol.clone();
        let percentage = decision.close_percentage.unwrap_or(0.0);

        let mut record = ActionRecord {
            action: decision.action.as_str().to_string(),
            symbol: symbol.clone(),
            quantity: 0.0,
            leverage: 0,
            price: 0.0,
            order_id: None,
            success: false,
            error: None,
        };

        let positions = match self.exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                record.error = Some(format!("position lookup failed: {e}"));
                return record;
            }
        };

        let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
            record.error = Some(format!("no open position for {symbol}"));
            return record;
        };

        let close_qty = position.quantity.abs() * percentage / 100.0;
        match self.exchange.close(&symbol, position.side, close_qty).await {
            Ok(fill) => {
                record.quantity = fill.executed_qty;
                record.price = fill.avg_price;
                record.order_id = Some(fill.order_id);
                record.success = true;
            }
            Err(e) => record.error = Some(e.to_string()),
        }
        record
    }
}

impl std::fmt::Debug for ExecutionSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSequencer")
            .field("cross_margin", &self.cross_margin)
            .finish()
    }
}
