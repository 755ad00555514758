// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(close, fast) - EMA(close, slow)
// Signal     = EMA(MACD line, signal_period)
// Histogram  = MACD line - Signal
//
// Standard parameters: fast = 12, slow = 26, signal = 9.
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// One MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the full MACD series for `closes`.
///
/// Output is aligned to the *end* of the input: the last element corresponds
/// to the last close. Returns an empty vec when there is not enough data for
/// the slow EMA plus the signal EMA.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Vec<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return Vec::new();
    }

    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    if slow_ema.is_empty() {
        return Vec::new();
    }

    // The slow EMA starts later; align the fast series to it from the tail.
    let offset = fast_ema.len().saturating_sub(slow_ema.len());
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, s)| fast_ema[offset + i] - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal_period);
    if signal_series.is_empty() {
        return Vec::new();
    }

    let macd_offset = macd_line.len() - signal_series.len();
    signal_series
        .iter()
        .enumerate()
        .map(|(i, &sig)| {
            let macd = macd_line[macd_offset + i];
            MacdResult {
                macd,
                signal: sig,
                histogram: macd - sig,
            }
        })
        .collect()
}

/// Most recent MACD reading with the standard 12/26/9 parameters.
pub fn current_macd(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(current_macd(&closes).is_none());
    }

    #[test]
    fn macd_bad_params() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_empty());
        assert!(calculate_macd(&closes, 26, 12, 9).is_empty());
    }

    #[test]
    fn macd_flat_series_is_zero() {
        let closes = vec![100.0; 100];
        let m = current_macd(&closes).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.signal.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn macd_uptrend_positive() {
        // In a steady uptrend the fast EMA rides above the slow EMA.
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let m = current_macd(&closes).unwrap();
        assert!(m.macd > 0.0, "expected positive MACD, got {}", m.macd);
    }

    #[test]
    fn macd_histogram_consistency() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        for r in calculate_macd(&closes, 12, 26, 9) {
            assert!((r.histogram - (r.macd - r.signal)).abs() < 1e-12);
        }
    }
}
