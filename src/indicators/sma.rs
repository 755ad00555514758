// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================

/// Most recent SMA over the last `period` values.
///
/// Returns `None` when `period` is zero, there is insufficient data, or the
/// result is non-finite.
pub fn current_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let sma = window.iter().sum::<f64>() / period as f64;
    sma.is_finite().then_some(sma)
}

/// Full SMA series; element `i` covers `values[i .. i + period]`.
pub fn calculate_sma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    values
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .take_while(|v| v.is_finite())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_basic() {
        let v = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(current_sma(&v, 2), Some(3.5));
        assert_eq!(calculate_sma(&v, 2), vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn sma_period_zero() {
        assert!(current_sma(&[1.0], 0).is_none());
        assert!(calculate_sma(&[1.0], 0).is_empty());
    }

    #[test]
    fn sma_insufficient_data() {
        assert!(current_sma(&[1.0, 2.0], 5).is_none());
    }

    #[test]
    fn sma_nan_rejected() {
        assert!(current_sma(&[1.0, f64::NAN], 2).is_none());
    }
}
