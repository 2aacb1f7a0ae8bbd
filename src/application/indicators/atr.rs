use crate::domain::market::Bar;
use rust_decimal::prelude::ToPrimitive;

/// Average True Range with Wilder smoothing. Needs `period + 1` bars (the
/// first true range uses the previous close).
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let ranges = true_ranges(bars);

    // Seed with the simple average of the first `period` true ranges.
    let mut value = ranges[..period].iter().sum::<f64>() / period as f64;
    for &tr in &ranges[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
    }

    value.is_finite().then_some(value)
}

/// True range series; one entry per bar starting at the second bar.
pub(crate) fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            let prev_close = w[0].close.to_f64().unwrap_or(0.0);
            let high = w[1].high.to_f64().unwrap_or(0.0);
            let low = w[1].low.to_f64().unwrap_or(0.0);
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect()
}
