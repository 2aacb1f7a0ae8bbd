use super::ema::ema_series;

/// MACD line, signal line and histogram at the latest bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Moving Average Convergence/Divergence.
///
/// `line = EMA(fast) - EMA(slow)`, `signal = EMA(signal_period)` of the
/// line, `histogram = line - signal`. Needs at least `slow + signal_period`
/// values.
pub fn macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<MacdValue> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if values.len() < slow + signal_period {
        return None;
    }

    let fast_series = ema_series(values, fast);
    let slow_series = ema_series(values, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series on the last bar: fast starts earlier.
    let offset = slow - fast;
    let line_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .filter_map(|(i, &s)| fast_series.get(i + offset).map(|f| f - s))
        .collect();

    let signal_series = ema_series(&line_series, signal_period);
    let line = *line_series.last()?;
    let signal = *signal_series.last()?;

    Some(MacdValue {
        line,
        signal,
        histogram: line - signal,
    })
}
