/// Simple moving average over the last `period` values.
///
/// Returns `None` when `period` is zero or there is not enough history.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let sum: f64 = window.iter().sum();
    let mean = sum / period as f64;
    mean.is_finite().then_some(mean)
}
