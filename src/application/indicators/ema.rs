/// Exponential moving average, seeded with the SMA of the first `period`
/// values and folded over the remainder of the series.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// Full EMA series starting at index `period - 1` of the input.
/// Used directly by MACD, which needs aligned fast/slow series.
pub(crate) fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);

    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(seed);
    let mut prev = seed;
    for &value in &values[period..] {
        let next = value * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            // A broken series must not be trusted downstream.
            break;
        }
        series.push(next);
        prev = next;
    }
    series
}
