// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// Each bar's true range is the widest of the bar span and the two gaps from
// the previous close. The first `period` ranges accumulate into a plain
// average; every range after that folds in through Wilder's recursion
//
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// The 4h snapshot bundle carries ATR3 and ATR14.
// =============================================================================

use crate::market::Bar;

/// Compute the most recent ATR value from a slice of OHLCV bars (oldest
/// first) using Wilder's smoothing method.
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// bars (each true range needs a previous close), or any intermediate value
/// is non-finite.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let n = period as f64;

    let mut smoothed = 0.0_f64;
    for (idx, pair) in bars.windows(2).enumerate() {
        let range = true_range(&pair[0], &pair[1]);
        smoothed = if idx < period {
            // Still inside the seed window: build up the plain average.
            smoothed + range / n
        } else {
            (smoothed * (n - 1.0) + range) / n
        };
        if !smoothed.is_finite() {
            return None;
        }
    }

    Some(smoothed)
}

/// True range of `bar` given the bar before it.
fn true_range(prev: &Bar, bar: &Bar) -> f64 {
    let span = bar.high - bar.low;
    let gap_high = (bar.high - prev.close).abs();
    let gap_low = (bar.low - prev.close).abs();
    span.max(gap_high).max(gap_low)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn true_range_picks_widest_measure() {
        // Plain span dominates.
        let a = bar(100.0, 105.0, 95.0, 100.0);
        let b = bar(100.0, 103.0, 97.0, 101.0);
        assert!((true_range(&a, &b) - 6.0).abs() < 1e-12);

        // Gap from the previous close dominates.
        let c = bar(100.0, 105.0, 95.0, 95.0);
        let d = bar(110.0, 115.0, 108.0, 112.0);
        assert!((true_range(&c, &d) - 20.0).abs() < 1e-12);
    }

    #[test]
    fn atr_period_zero() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&bars, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&bars, 14).is_none());
    }

    #[test]
    fn atr_exact_minimum_data() {
        // period=3 needs 4 bars for 3 true ranges.
        let bars = vec![
            bar(100.0, 102.0, 98.0, 101.0),
            bar(101.0, 104.0, 99.0, 103.0),
            bar(103.0, 106.0, 100.0, 105.0),
            bar(105.0, 108.0, 102.0, 107.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > 0.0 && atr.is_finite());
    }

    #[test]
    fn atr_seed_is_plain_average() {
        // Exactly period+1 bars: the result is the mean of the ranges.
        let bars = vec![
            bar(100.0, 104.0, 96.0, 100.0), // -
            bar(100.0, 102.0, 98.0, 100.0), // range 4
            bar(100.0, 103.0, 97.0, 100.0), // range 6
            bar(100.0, 101.0, 99.0, 100.0), // range 2
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!((atr - 4.0).abs() < 1e-12, "expected mean 4.0, got {atr}");
    }

    #[test]
    fn atr_constant_range() {
        // Constant H-L of 10 with close at midpoint converges to ATR ~10.
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            bars.push(bar(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_reflects_gaps() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0), // gap up: |115-95|=20 > 7
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_nan_returns_none() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&bars, 3).is_none());
    }
}
