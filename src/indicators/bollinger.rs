// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = mean of the window, upper/lower = mean ± k * population
// standard deviation. The snapshot bundle uses the standard 20-period, 2σ
// configuration.

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone, Copy)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Calculate Bollinger Bands over the most recent `period` closes.
///
/// Returns `None` when there are fewer than `period` data points, the mean
/// is zero (degenerate input), or the result is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let recent = &closes[closes.len() - period..];
    let n = period as f64;

    let mean = recent.iter().sum::<f64>() / n;
    if mean == 0.0 || !mean.is_finite() {
        return None;
    }

    let squared_devs = recent.iter().fold(0.0_f64, |acc, &close| {
        let dev = close - mean;
        acc + dev * dev
    });
    let band = num_std * (squared_devs / n).sqrt();

    let result = BollingerResult {
        upper: mean + band,
        middle: mean,
        lower: mean - band,
    };

    (result.upper.is_finite() && result.lower.is_finite()).then_some(result)
}

/// Standard 20-period 2σ bands.
pub fn standard_bollinger(closes: &[f64]) -> Option<BollingerResult> {
    calculate_bollinger(closes, 20, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = standard_bollinger(&closes).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
    }

    #[test]
    fn bollinger_bands_symmetric_about_mean() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i as f64 * 0.9).sin() * 3.0).collect();
        let bb = standard_bollinger(&closes).unwrap();
        assert!(((bb.upper - bb.middle) - (bb.middle - bb.lower)).abs() < 1e-10);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(standard_bollinger(&closes).is_none());
    }

    #[test]
    fn bollinger_flat_bands_collapse() {
        let closes = vec![100.0; 20];
        let bb = standard_bollinger(&closes).unwrap();
        assert!((bb.upper - bb.lower).abs() < 1e-10);
        assert!((bb.middle - 100.0).abs() < 1e-10);
    }

    #[test]
    fn bollinger_nan_rejected() {
        let mut closes = vec![100.0; 20];
        closes[5] = f64::NAN;
        assert!(standard_bollinger(&closes).is_none());
    }
}
