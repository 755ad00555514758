// =============================================================================
// Drawdown Monitor — independent peak-tracking and emergency close
// =============================================================================
//
// A parallel task per trader, polling positions once per minute. For every
// open position the current leveraged return is computed and a per-symbol
// peak is maintained. A position whose return is still above +5% but has
// given back at least 40% of its peak is closed through the adapter,
// independent of the LLM loop. The monitor never opens positions and reads
// no engine state except through the adapter.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::exchange::Exchange;
use crate::types::{Position, PositionSide};

/// Poll period.
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Current return must exceed this before an emergency close can fire.
const MIN_PROFIT_PCT: f64 = 5.0;

/// Give-back fraction of the peak that triggers the close.
const DRAWDOWN_TRIGGER: f64 = 0.40;

/// Per-trader drawdown watcher.
pub struct DrawdownMonitor {
    trader_id: String,
    exchange: Arc<dyn Exchange>,
    /// Peak leveraged return (percent of margin) per symbol.
    peaks: Mutex<HashMap<String, f64>>,
}

impl DrawdownMonitor {
    pub fn new(trader_id: impl Into<String>, exchange: Arc<dyn Exchange>) -> Self {
        Self {
            trader_id: trader_id.into(),
            exchange,
            peaks: Mutex::new(HashMap::new()),
        }
    }

    /// Run until the stop signal flips. Spawned once per trader at start.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(
            trader_id = %self.trader_id,
            interval_secs = MONITOR_INTERVAL.as_secs(),
            "drawdown monitor started"
        );

        let mut ticker = interval(MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!(trader_id = %self.trader_id, "drawdown monitor stopped");
    }

    /// One evaluation pass: refresh positions, update peaks, close whatever
    /// tripped the give-back rule.
    pub async fn tick_once(&self) {
        let positions = match self.exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(trader_id = %self.trader_id, error = %e, "monitor position fetch failed");
                return;
            }
        };

        let to_close = {
            let mut peaks = self.peaks.lock();
            evaluate_tick(&mut peaks, &positions)
        };

        for (symbol, side) in to_close {
            info!(
                trader_id = %self.trader_id,
                symbol = %symbol,
                side = %side,
                "EMERGENCY CLOSE — drawdown give-back tripped"
            );
            match self.exchange.close(&symbol, side, 0.0).await {
                Ok(fill) => info!(
                    trader_id = %self.trader_id,
                    symbol = %symbol,
                    order_id = %fill.order_id,
                    quantity = fill.executed_qty,
                    "emergency close filled"
                ),
                Err(e) => warn!(
                    trader_id = %self.trader_id,
                    symbol = %symbol,
                    error = %e,
                    "emergency close failed"
                ),
            }
        }
    }
}

/// Whether a position at `current` return with the given `peak` must be
/// emergency-closed: still above the +5% profit floor, but has given back at
/// least 40% of its peak.
pub fn drawdown_trips(peak: f64, current: f64) -> bool {
    current > MIN_PROFIT_PCT && peak > 0.0 && (peak - current) / peak >= DRAWDOWN_TRIGGER
}

/// One pure evaluation step over the peak map.
///
/// Updates peaks to `max(peak, current)`, drops entries whose position has
/// disappeared, and returns the (symbol, side) pairs to close. A triggering
/// symbol's peak entry is cleared so a reopened position starts a new
/// lifetime.
pub fn evaluate_tick(
    peaks: &mut HashMap<String, f64>,
    positions: &[Position],
) -> Vec<(String, PositionSide)> {
    peaks.retain(|symbol, _| positions.iter().any(|p| &p.symbol == symbol));

    let mut to_close = Vec::new();

    for position in positions {
        let current = position.leveraged_return_pct();
        let peak = peaks
            .entry(position.symbol.clone())
            .or_insert(current);
        if current > *peak {
            *peak = current;
        }
        let peak_value = *peak;

        if drawdown_trips(peak_value, current) {
            to_close.push((position.symbol.clone(), position.side));
            continue;
        }

        debug!(
            symbol = %position.symbol,
            current_pct = current,
            peak_pct = peak_value,
            "drawdown tick"
        );
    }

    for (symbol, _) in &to_close {
        peaks.remove(symbol);
    }

    to_close
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;

    /// A long with entry 100 at 10x; `mark` expresses the leveraged return,
    /// e.g. 100.75 → +7.5%.
    fn long(symbol: &str, mark: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            entry_price: 100.0,
            mark_price: mark,
            quantity: 1.0,
            leverage: 10,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            margin_used: 10.0,
            first_observed_at: None,
        }
    }

    #[test]
    fn no_close_when_current_below_profit_floor() {
        let mut peaks = HashMap::new();

        // Peaks observed: +7, then +6, then +4.
        assert!(evaluate_tick(&mut peaks, &[long("SOLUSDT", 100.70)]).is_empty());
        assert!(evaluate_tick(&mut peaks, &[long("SOLUSDT", 100.60)]).is_empty());
        // Give-back (7−4)/7 ≈ 42.8% ≥ 40%, but current 4% fails the >5% floor.
        assert!(evaluate_tick(&mut peaks, &[long("SOLUSDT", 100.40)]).is_empty());
    }

    #[test]
    fn no_close_when_deep_give_back_but_tiny_profit() {
        let mut peaks = HashMap::new();
        assert!(evaluate_tick(&mut peaks, &[long("SOLUSDT", 101.00)]).is_empty()); // +10
        // (10−3.9)/10 = 61%, but 3.9% is not > 5%.
        assert!(evaluate_tick(&mut peaks, &[long("SOLUSDT", 100.39)]).is_empty());
    }

    #[test]
    fn close_fires_above_floor_and_trigger() {
        let mut peaks = HashMap::new();
        assert!(evaluate_tick(&mut peaks, &[long("SOLUSDT", 101.00)]).is_empty()); // +10
        // (10−5.5)/10 = 45% ≥ 40% and 5.5% > 5%.
        let closes = evaluate_tick(&mut peaks, &[long("SOLUSDT", 100.55)]);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, "SOLUSDT");
        assert_eq!(closes[0].1, PositionSide::Long);
        // Peak entry cleared for the next lifetime.
        assert!(!peaks.contains_key("SOLUSDT"));
    }

    #[test]
    fn give_back_exactly_forty_percent_triggers() {
        // (10 − 6) / 10 computes to exactly 0.4.
        assert!(drawdown_trips(10.0, 6.0));
    }

    #[test]
    fn give_back_just_below_forty_percent_does_not_trigger() {
        // 39.9% give-back.
        assert!(!drawdown_trips(10.0, 6.01));
    }

    #[test]
    fn profit_floor_is_strict() {
        // Exactly 5% fails the "> 5%" floor even with a deep give-back.
        assert!(!drawdown_trips(20.0, 5.0));
        assert!(drawdown_trips(20.0, 5.5));
    }

    #[test]
    fn short_side_mirrored() {
        let mut peaks = HashMap::new();
        let mut pos = long("SOLUSDT", 98.75); // short below entry is profit
        pos.side = PositionSide::Short;
        // Current return: +12.5%.
        assert!(evaluate_tick(&mut peaks, std::slice::from_ref(&pos)).is_empty());
        assert!((peaks["SOLUSDT"] - 12.5).abs() < 1e-9);

        // Retrace to +5.5% → (12.5−5.5)/12.5 = 56% give-back, close fires.
        pos.mark_price = 99.45;
        let closes = evaluate_tick(&mut peaks, std::slice::from_ref(&pos));
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].1, PositionSide::Short);
    }

    #[test]
    fn peaks_cleared_for_vanished_positions() {
        let mut peaks = HashMap::new();
        evaluate_tick(&mut peaks, &[long("SOLUSDT", 100.70)]);
        assert!(peaks.contains_key("SOLUSDT"));
        evaluate_tick(&mut peaks, &[]);
        assert!(peaks.is_empty());
    }

    #[tokio::test]
    async fn tick_closes_through_adapter() {
        let exchange = Arc::new(MockExchange::new().with_mark_price("SOLUSDT", 100.55));
        exchange.push_position(long("SOLUSDT", 100.55));

        let monitor = DrawdownMonitor::new("t1", exchange.clone());
        monitor.peaks.lock().insert("SOLUSDT".to_string(), 12.5);

        monitor.tick_once().await;

        let calls = exchange.call_log();
        assert!(calls.iter().any(|c| c.starts_with("close SOLUSDT long")));
        assert!(exchange.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn monitor_never_opens() {
        let exchange = Arc::new(MockExchange::new());
        let monitor = DrawdownMonitor::new("t1", exchange.clone());
        monitor.tick_once().await;
        assert!(exchange.call_log().iter().all(|c| !c.starts_with("open")));
    }
}
