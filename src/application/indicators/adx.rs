use super::atr::true_ranges;
use crate::domain::market::Bar;
use rust_decimal::prelude::ToPrimitive;

/// Average Directional Index with Wilder smoothing.
///
/// Measures trend strength on a 0..100 scale regardless of direction.
/// Needs `2 * period + 1` bars: one period to seed the smoothed directional
/// movements and another to average the DX series.
pub fn adx(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let trs = true_ranges(bars);
    let (plus_dm, minus_dm) = directional_movements(bars);

    let p = period as f64;

    // Wilder-smoothed running sums, seeded over the first period.
    let mut smooth_tr: f64 = trs[..period].iter().sum();
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(trs.len() - period + 1);
    dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..trs.len() {
        smooth_tr = smooth_tr - smooth_tr / p + trs[i];
        smooth_plus = smooth_plus - smooth_plus / p + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / p + minus_dm[i];
        dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX: Wilder average of the DX series.
    let mut value = dx_values[..period].iter().sum::<f64>() / p;
    for &d in &dx_values[period..] {
        value = (value * (p - 1.0) + d) / p;
    }
    value.is_finite().then_some(value)
}

fn dx(plus: f64, minus: f64, tr: f64) -> Option<f64> {
    if tr <= 0.0 {
        return Some(0.0);
    }
    let plus_di = 100.0 * plus / tr;
    let minus_di = 100.0 * minus / tr;
    let sum = plus_di + minus_di;
    if sum == 0.0 {
        return Some(0.0);
    }
    let value = 100.0 * (plus_di - minus_di).abs() / sum;
    value.is_finite().then_some(value)
}

/// +DM / -DM series; one entry per bar starting at the second bar.
fn directional_movements(bars: &[Bar]) -> (Vec<f64>, Vec<f64>) {
    let mut plus = Vec::with_capacity(bars.len().saturating_sub(1));
    let mut minus = Vec::with_capacity(bars.len().saturating_sub(1));
    for w in bars.windows(2) {
        let up = w[1].high.to_f64().unwrap_or(0.0) - w[0].high.to_f64().unwrap_or(0.0);
        let down = w[0].low.to_f64().unwrap_or(0.0) - w[1].low.to_f64().unwrap_or(0.0);
        if up > down && up > 0.0 {
            plus.push(up);
            minus.push(0.0);
        } else if down > up && down > 0.0 {
            plus.push(0.0);
            minus.push(down);
        } else {
            plus.push(0.0);
            minus.push(0.0);
        }
    }
    (plus, minus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::indicators::test_support::bars_from_closes;

    #[test]
    fn test_adx_strong_trend_is_high() {
        let closes: Vec<f64> = (1..=60).map(|i| 100.0 + i as f64).collect();
        let value = adx(&bars_from_closes(&closes), 14).unwrap();
        assert!(value > 75.0, "steady uptrend should score high, got {value}");
    }

    #[test]
    fn test_adx_flat_market_is_low() {
        let closes = vec![100.0; 60];
        let value = adx(&bars_from_closes(&closes), 14).unwrap();
        assert!(value < 5.0, "flat market should score low, got {value}");
    }

    #[test]
    fn test_adx_bounds() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + ((i * 17) % 11) as f64 - 5.0)
            .collect();
        let value = adx(&bars_from_closes(&closes), 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn test_adx_guards() {
        let bars = bars_from_closes(&[100.0; 20]);
        assert!(adx(&bars, 14).is_none()); // needs 29 bars
        assert!(adx(&bars, 0).is_none());
    }
}
