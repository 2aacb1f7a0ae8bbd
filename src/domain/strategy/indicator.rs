use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar selector for MACD, which produces three series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MacdOutput {
    #[default]
    Line,
    Signal,
    Histogram,
}

/// Scalar selector for Bollinger Bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BollingerBand {
    Upper,
    #[default]
    Middle,
    Lower,
}

/// Scalar selector for the Stochastic oscillator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StochasticOutput {
    #[default]
    K,
    D,
}

fn default_bollinger_width() -> Decimal {
    Decimal::TWO
}

/// A fully parameterized indicator reference, as written in rule trees.
///
/// Every variant evaluates to one scalar over a window of finalized bars.
/// The tuple `(symbol, timeframe, spec, last bar open time)` is the
/// memoization key in the indicator cache, so this type is `Hash + Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Sma {
        period: usize,
    },
    Ema {
        period: usize,
    },
    Rsi {
        period: usize,
    },
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
        #[serde(default)]
        output: MacdOutput,
    },
    Bollinger {
        period: usize,
        #[serde(default = "default_bollinger_width")]
        width: Decimal,
        #[serde(default)]
        band: BollingerBand,
    },
    Atr {
        period: usize,
    },
    Adx {
        period: usize,
    },
    Stochastic {
        k_period: usize,
        d_period: usize,
        #[serde(default)]
        output: StochasticOutput,
    },
}

impl fmt::Display for IndicatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorSpec::Sma { period } => write!(f, "sma({period})"),
            IndicatorSpec::Ema { period } => write!(f, "ema({period})"),
            IndicatorSpec::Rsi { period } => write!(f, "rsi({period})"),
            IndicatorSpec::Macd {
                fast,
                slow,
                signal,
                output,
            } => write!(f, "macd({fast},{slow},{signal}).{output:?}"),
            IndicatorSpec::Bollinger {
                period,
                width,
                band,
            } => write!(f, "bollinger({period},{width}).{band:?}"),
            IndicatorSpec::Atr { period } => write!(f, "atr({period})"),
            IndicatorSpec::Adx { period } => write!(f, "adx({period})"),
            IndicatorSpec::Stochastic {
                k_period,
                d_period,
                output,
            } => write!(f, "stochastic({k_period},{d_period}).{output:?}"),
        }
    }
}
