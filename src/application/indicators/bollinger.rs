use super::sma::sma;

/// Bollinger Bands at the latest bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerValue {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Bollinger Bands: SMA(`period`) ± `width` population standard deviations.
pub fn bollinger(values: &[f64], period: usize, width: f64) -> Option<BollingerValue> {
    if period == 0 || values.len() < period || !width.is_finite() || width < 0.0 {
        return None;
    }
    let middle = sma(values, period)?;
    let window = &values[values.len() - period..];

    let variance =
        window.iter().map(|v| (v - middle) * (v - middle)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();
    if !std_dev.is_finite() {
        return None;
    }

    Some(BollingerValue {
        upper: middle + width * std_dev,
        middle,
        lower: middle - width * std_dev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_series_collapses_bands() {
        let values = vec![50.0; 30];
        let bands = bollinger(&values, 20, 2.0).unwrap();
        assert_eq!(bands.upper, 50.0);
        assert_eq!(bands.middle, 50.0);
        assert_eq!(bands.lower, 50.0);
    }

    #[test]
    fn test_known_values() {
        // Window [2, 4, 4, 4, 5, 5, 7, 9]: mean 5, population std dev 2
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bands = bollinger(&values, 8, 2.0).unwrap();
        assert!((bands.middle - 5.0).abs() < 1e-12);
        assert!((bands.upper - 9.0).abs() < 1e-12);
        assert!((bands.lower - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_bands_are_symmetric() {
        let values: Vec<f64> = (0..40).map(|i| 100.0 + ((i * 13) % 7) as f64).collect();
        let bands = bollinger(&values, 20, 2.0).unwrap();
        let up = bands.upper - bands.middle;
        let down = bands.middle - bands.lower;
        assert!((up - down).abs() < 1e-12);
        assert!(up > 0.0);
    }

    #[test]
    fn test_guards() {
        assert!(bollinger(&[1.0; 5], 20, 2.0).is_none());
        assert!(bollinger(&[1.0; 30], 0, 2.0).is_none());
        assert!(bollinger(&[1.0; 30], 20, -1.0).is_none());
        assert!(bollinger(&[1.0; 30], 20, f64::NAN).is_none());
    }
}
