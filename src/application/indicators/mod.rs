//! Technical indicator library.
//!
//! Each indicator is a pure function of `(window, parameters)` producing a
//! scalar or a small struct; extension is by adding another function. The
//! market-data store memoizes results per finalized bar, so these functions
//! only run once per `(symbol, timeframe, spec)` per bar close.

mod adx;
mod atr;
mod bollinger;
mod ema;
mod macd;
mod rsi;
mod sma;
mod stochastic;

pub use adx::adx;
pub use atr::atr;
pub use bollinger::{BollingerValue, bollinger};
pub use ema::ema;
pub use macd::{MacdValue, macd};
pub use rsi::rsi;
pub use sma::sma;
pub use stochastic::{StochasticValue, stochastic};

use crate::domain::market::Bar;
use crate::domain::strategy::{BollingerBand, IndicatorSpec, MacdOutput, StochasticOutput};
use rust_decimal::prelude::ToPrimitive;

/// Extract the close series as `f64`, oldest first.
pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .map(|b| b.close.to_f64().unwrap_or(0.0))
        .collect()
}

/// Minimum number of finalized bars needed before the spec produces a value.
pub fn required_bars(spec: &IndicatorSpec) -> usize {
    match spec {
        IndicatorSpec::Sma { period } | IndicatorSpec::Ema { period } => *period,
        IndicatorSpec::Rsi { period } => period + 1,
        IndicatorSpec::Macd { slow, signal, .. } => slow + signal,
        IndicatorSpec::Bollinger { period, .. } => *period,
        IndicatorSpec::Atr { period } => period + 1,
        // ADX needs a smoothing warmup on top of the DX series
        IndicatorSpec::Adx { period } => 2 * period + 1,
        IndicatorSpec::Stochastic {
            k_period, d_period, ..
        } => k_period + d_period - 1,
    }
}

/// Evaluate one spec over a window of finalized bars, oldest first.
/// Returns `None` on insufficient history.
pub fn compute(spec: &IndicatorSpec, bars: &[Bar]) -> Option<f64> {
    if bars.len() < required_bars(spec) {
        return None;
    }
    match spec {
        IndicatorSpec::Sma { period } => sma(&closes(bars), *period),
        IndicatorSpec::Ema { period } => ema(&closes(bars), *period),
        IndicatorSpec::Rsi { period } => rsi(&closes(bars), *period),
        IndicatorSpec::Macd {
            fast,
            slow,
            signal,
            output,
        } => {
            let value = macd(&closes(bars), *fast, *slow, *signal)?;
            Some(match output {
                MacdOutput::Line => value.line,
                MacdOutput::Signal => value.signal,
                MacdOutput::Histogram => value.histogram,
            })
        }
        IndicatorSpec::Bollinger {
            period,
            width,
            band,
        } => {
            let width = width.to_f64().unwrap_or(2.0);
            let value = bollinger(&closes(bars), *period, width)?;
            Some(match band {
                BollingerBand::Upper => value.upper,
                BollingerBand::Middle => value.middle,
                BollingerBand::Lower => value.lower,
            })
        }
        IndicatorSpec::Atr { period } => atr(bars, *period),
        IndicatorSpec::Adx { period } => adx(bars, *period),
        IndicatorSpec::Stochastic {
            k_period,
            d_period,
            output,
        } => {
            let value = stochastic(bars, *k_period, *d_period)?;
            Some(match output {
                StochasticOutput::K => value.k,
                StochasticOutput::D => value.d,
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_support::bars_from_closes;

    #[test]
    fn test_insufficient_history_returns_none() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0]);
        assert_eq!(compute(&IndicatorSpec::Sma { period: 5 }, &bars), None);
        assert_eq!(compute(&IndicatorSpec::Adx { period: 14 }, &bars), None);
    }

    #[test]
    fn test_dispatch_matches_direct_call() {
        let values: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let bars = bars_from_closes(&values);
        let via_dispatch = compute(&IndicatorSpec::Sma { period: 10 }, &bars).unwrap();
        let direct = sma(&closes(&bars), 10).unwrap();
        assert!((via_dispatch - direct).abs() < 1e-12);
    }

    #[test]
    fn test_macd_outputs_are_consistent() {
        let values: Vec<f64> = (1..=80).map(|i| (i as f64).sin() * 5.0 + 100.0).collect();
        let bars = bars_from_closes(&values);
        let spec = |output| IndicatorSpec::Macd {
            fast: 12,
            slow: 26,
            signal: 9,
            output,
        };
        let line = compute(&spec(MacdOutput::Line), &bars).unwrap();
        let signal = compute(&spec(MacdOutput::Signal), &bars).unwrap();
        let hist = compute(&spec(MacdOutput::Histogram), &bars).unwrap();
        assert!((line - signal - hist).abs() < 1e-9);
    }
}
