// =============================================================================
// KDJ Stochastic Oscillator
// =============================================================================
//
// RSV_t = (close - lowest_low(period)) / (highest_high(period) - lowest_low(period)) * 100
// K_t   = 2/3 * K_{t-1} + 1/3 * RSV_t        (seeded at 50)
// D_t   = 2/3 * D_{t-1} + 1/3 * K_t          (seeded at 50)
// J_t   = 3 * K_t - 2 * D_t
//
// The standard 9-period lookback is used by the snapshot bundle.
// =============================================================================

use crate::market::Bar;

/// One KDJ reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KdjResult {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

/// Compute the full KDJ series over `bars` with the given RSV `period`.
///
/// One reading per bar starting at index `period - 1`. A flat window (highest
/// high equals lowest low) contributes a neutral RSV of 50.
pub fn calculate_kdj(bars: &[Bar], period: usize) -> Vec<KdjResult> {
    if period == 0 || bars.len() < period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(bars.len() - period + 1);
    let mut k = 50.0_f64;
    let mut d = 50.0_f64;

    for i in (period - 1)..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);

        let range = highest - lowest;
        let rsv = if range > 0.0 {
            (bars[i].close - lowest) / range * 100.0
        } else {
            50.0
        };

        if !rsv.is_finite() {
            break;
        }

        k = k * 2.0 / 3.0 + rsv / 3.0;
        d = d * 2.0 / 3.0 + k / 3.0;
        let j = 3.0 * k - 2.0 * d;

        result.push(KdjResult { k, d, j });
    }

    result
}

/// Most recent KDJ reading with the standard 9-period lookback.
pub fn current_kdj(bars: &[Bar]) -> Option<KdjResult> {
    calculate_kdj(bars, 9).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn kdj_insufficient_data() {
        let bars = vec![bar(10.0, 9.0, 9.5); 5];
        assert!(current_kdj(&bars).is_none());
    }

    #[test]
    fn kdj_flat_window_neutral() {
        // No range at all: RSV stays 50, so K, D, J all converge to 50.
        let bars = vec![bar(100.0, 100.0, 100.0); 30];
        let kdj = current_kdj(&bars).unwrap();
        assert!((kdj.k - 50.0).abs() < 1e-9);
        assert!((kdj.d - 50.0).abs() < 1e-9);
        assert!((kdj.j - 50.0).abs() < 1e-9);
    }

    #[test]
    fn kdj_close_at_high_pushes_up() {
        // Closes pinned at the window high drive RSV to 100 and K above D.
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base - 5.0, base)
            })
            .collect();
        let kdj = current_kdj(&bars).unwrap();
        assert!(kdj.k > 80.0, "K should be high, got {}", kdj.k);
        assert!(kdj.j >= kdj.k, "J amplifies K above D");
    }

    #[test]
    fn kdj_j_identity() {
        let bars: Vec<Bar> = (0..40)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 10.0;
                bar(base + 2.0, base - 2.0, base)
            })
            .collect();
        for r in calculate_kdj(&bars, 9) {
            assert!((r.j - (3.0 * r.k - 2.0 * r.d)).abs() < 1e-9);
        }
    }
}
