// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Recursive smoothing with a = 2 / (period + 1):
//
//   EMA_t = EMA_{t-1} + a * (close_t - EMA_{t-1})
//
// seeded with the plain mean of the first `period` closes.
// =============================================================================

/// Compute the EMA series for the given `closes` slice and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
/// A non-finite value truncates the series; downstream consumers should not
/// trust anything past it.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let (head, tail) = closes.split_at(period);

    let seed = head.iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut level = seed;
    let mut series = Vec::with_capacity(tail.len() + 1);
    series.push(seed);
    series.extend(tail.iter().map_while(|&price| {
        level += alpha * (price - level);
        level.is_finite().then_some(level)
    }));

    series
}

/// Most recent EMA value, if computable.
pub fn current_ema(closes: &[f64], period: usize) -> Option<f64> {
    calculate_ema(closes, period).last().copied()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_period_equals_length() {
        let closes = vec![2.0, 4.0, 6.0];
        let ema = calculate_ema(&closes, 3);
        assert_eq!(ema.len(), 1);
        // Just the seed: mean of (2+4+6)/3 = 4.0
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of [1..10]; seed = 3.0, a = 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let a = 2.0 / 6.0;
        let mut expected = 3.0;
        let mut expected_vec = vec![expected];
        for &c in &closes[5..] {
            expected = c * a + expected * (1.0 - a);
            expected_vec.push(expected);
        }
        for (got, want) in ema.iter().zip(expected_vec.iter()) {
            assert!((got - want).abs() < 1e-10, "got {got}, expected {want}");
        }
    }

    #[test]
    fn ema_converges_to_constant() {
        let mut closes = vec![50.0; 5];
        closes.extend(std::iter::repeat(100.0).take(200));
        let last = current_ema(&closes, 5).unwrap();
        assert!((last - 100.0).abs() < 1e-6, "expected convergence, got {last}");
    }

    #[test]
    fn ema_handles_nan_in_input() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let ema = calculate_ema(&closes, 3);
        // Seed of the first 3 is fine, then NaN truncates everything after.
        assert_eq!(ema.len(), 1);
    }

    #[test]
    fn current_ema_matches_series_tail() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        let series = calculate_ema(&closes, 20);
        assert_eq!(current_ema(&closes, 20), series.last().copied());
    }
}
