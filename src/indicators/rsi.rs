// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Upward and downward moves are smoothed separately: plain averages over the
// first `period` moves seed the state, after which Wilder's recursion
//
//   up_t   = (up_{t-1}   * (period - 1) + max(move, 0)) / period
//   down_t = (down_{t-1} * (period - 1) + max(-move, 0)) / period
//
// feeds RSI = 100 * up / (up + down).
//
// The snapshot bundle uses a short 7-period RSI.
// =============================================================================

/// Compute the full RSI series for the given `closes` and `period`.
///
/// One RSI value per close starting at index `period` (the first `period`
/// closes seed the averages).
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => empty vec
/// - Only upward moves pin RSI at 100; no movement at all yields 50.
/// - Non-finite results truncate the series.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }
    let n = period as f64;

    // Seed: plain averages of the first `period` moves.
    let mut up = 0.0_f64;
    let mut down = 0.0_f64;
    for pair in closes[..=period].windows(2) {
        let step = pair[1] - pair[0];
        up += step.max(0.0);
        down += (-step).max(0.0);
    }
    up /= n;
    down /= n;

    let mut series = Vec::with_capacity(closes.len() - period);
    match rsi_value(up, down) {
        Some(value) => series.push(value),
        None => return series,
    }

    // Wilder's recursion over the remaining moves.
    for pair in closes[period..].windows(2) {
        let step = pair[1] - pair[0];
        up = (up * (n - 1.0) + step.max(0.0)) / n;
        down = (down * (n - 1.0) + (-step).max(0.0)) / n;

        match rsi_value(up, down) {
            Some(value) => series.push(value),
            None => break,
        }
    }

    series
}

/// Most recent RSI value, if computable.
pub fn current_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

/// RSI in [0, 100] from the smoothed up/down averages. `100 * up / (up +
/// down)` is the index; a dead market (both zero) reads neutral.
fn rsi_value(up: f64, down: f64) -> Option<f64> {
    let value = if up == 0.0 && down == 0.0 {
        50.0
    } else {
        100.0 * up / (up + down)
    };
    value.is_finite().then_some(value)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_empty_input() {
        assert!(calculate_rsi(&[], 7).is_empty());
    }

    #[test]
    fn rsi_period_zero() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn rsi_insufficient_data() {
        // Need period+1 closes. 7 closes => 6 moves < 7.
        let closes: Vec<f64> = (1..=7).map(|x| x as f64).collect();
        assert!(calculate_rsi(&closes, 7).is_empty());
    }

    #[test]
    fn rsi_all_gains() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for &v in &calculate_rsi(&closes, 7) {
            assert!((v - 100.0).abs() < 1e-10, "expected 100.0, got {v}");
        }
    }

    #[test]
    fn rsi_all_losses() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for &v in &calculate_rsi(&closes, 7) {
            assert!(v.abs() < 1e-10, "expected 0.0, got {v}");
        }
    }

    #[test]
    fn rsi_flat_market_neutral() {
        let closes = vec![100.0; 30];
        for &v in &calculate_rsi(&closes, 7) {
            assert!((v - 50.0).abs() < 1e-10, "expected 50.0, got {v}");
        }
    }

    #[test]
    fn rsi_series_length() {
        // One value per close from index `period` on.
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64).sin()).collect();
        assert_eq!(calculate_rsi(&closes, 7).len(), 30 - 7);
    }

    #[test]
    fn rsi_range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for &v in &calculate_rsi(&closes, 7) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn current_rsi_none_on_bad_input() {
        assert!(current_rsi(&[], 7).is_none());
    }
}
