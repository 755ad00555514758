// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
// Signed-volume cumulation: volume is added on an up-close, subtracted on a
// down-close, and ignored on an unchanged close. The absolute level is
// arbitrary; the slope is the signal.

use crate::market::Bar;

/// Compute the full OBV series. One value per bar; the first bar seeds at 0.
pub fn calculate_obv(bars: &[Bar]) -> Vec<f64> {
    if bars.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(bars.len());
    let mut obv = 0.0_f64;
    result.push(obv);

    for w in bars.windows(2) {
        let prev = &w[0];
        let cur = &w[1];
        if cur.close > prev.close {
            obv += cur.volume;
        } else if cur.close < prev.close {
            obv -= cur.volume;
        }
        if !obv.is_finite() {
            break;
        }
        result.push(obv);
    }

    result
}

/// Most recent OBV value.
pub fn current_obv(bars: &[Bar]) -> Option<f64> {
    calculate_obv(bars).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, volume: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn obv_empty() {
        assert!(calculate_obv(&[]).is_empty());
    }

    #[test]
    fn obv_single_bar_zero() {
        assert_eq!(calculate_obv(&[bar(100.0, 50.0)]), vec![0.0]);
    }

    #[test]
    fn obv_up_down_unchanged() {
        let bars = vec![
            bar(100.0, 10.0),
            bar(101.0, 20.0), // up: +20
            bar(100.0, 5.0),  // down: -5
            bar(100.0, 99.0), // unchanged: ignored
        ];
        assert_eq!(calculate_obv(&bars), vec![0.0, 20.0, 15.0, 15.0]);
    }

    #[test]
    fn obv_steady_uptrend_monotonic() {
        let bars: Vec<Bar> = (1..=20).map(|i| bar(i as f64, 1.0)).collect();
        let obv = calculate_obv(&bars);
        for w in obv.windows(2) {
            assert!(w[1] > w[0]);
        }
    }
}
