use crate::domain::market::Bar;
use rust_decimal::prelude::ToPrimitive;

/// Stochastic oscillator at the latest bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochasticValue {
    pub k: f64,
    pub d: f64,
}

/// %K over `k_period` bars with a `d_period` SMA for %D.
/// Needs `k_period + d_period - 1` bars.
pub fn stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> Option<StochasticValue> {
    if k_period == 0 || d_period == 0 || bars.len() < k_period + d_period - 1 {
        return None;
    }

    // %K for the last `d_period` bars so %D has a full window.
    let mut k_values = Vec::with_capacity(d_period);
    for offset in (0..d_period).rev() {
        let end = bars.len() - offset;
        let window = &bars[end - k_period..end];
        k_values.push(percent_k(window)?);
    }

    let k = *k_values.last()?;
    let d = k_values.iter().sum::<f64>() / d_period as f64;
    Some(StochasticValue { k, d })
}

fn percent_k(window: &[Bar]) -> Option<f64> {
    let close = window.last()?.close.to_f64()?;
    let mut lowest = f64::INFINITY;
    let mut highest = f64::NEG_INFINITY;
    for bar in window {
        lowest = lowest.min(bar.low.to_f64()?);
        highest = highest.max(bar.high.to_f64()?);
    }
    let range = highest - lowest;
    if range <= 0.0 {
        // Degenerate window; by convention sit in the middle.
        return Some(50.0);
    }
    let value = 100.0 * (close - lowest) / range;
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::indicators::test_support::bars_from_closes;

    #[test]
    fn test_top_of_range_is_high() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let value = stochastic(&bars_from_closes(&closes), 14, 3).unwrap();
        assert!(value.k > 90.0);
        assert!(value.d > 90.0);
    }

    #[test]
    fn test_bottom_of_range_is_low() {
        let closes: Vec<f64> = (1..=30).rev().map(|i| i as f64).collect();
        let value = stochastic(&bars_from_closes(&closes), 14, 3).unwrap();
        assert!(value.k < 10.0);
        assert!(value.d < 10.0);
    }

    #[test]
    fn test_flat_window_sits_in_middle() {
        let value = stochastic(&bars_from_closes(&[100.0; 30]), 14, 3).unwrap();
        // Helper bars carry a fixed high/low spread around a flat close.
        assert!((value.k - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_d_is_sma_of_k() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + ((i * 7) % 13) as f64).collect();
        let bars = bars_from_closes(&closes);
        let value = stochastic(&bars, 14, 1).unwrap();
        // With d_period = 1 the two outputs coincide.
        assert!((value.k - value.d).abs() < 1e-12);
    }

    #[test]
    fn test_guards() {
        let bars = bars_from_closes(&[100.0; 10]);
        assert!(stochastic(&bars, 14, 3).is_none());
        assert!(stochastic(&bars, 0, 3).is_none());
        assert!(stochastic(&bars, 5, 0).is_none());
    }
}
