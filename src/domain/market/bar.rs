use super::timeframe::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single bid/ask update from the broker stream. Not stored long-term;
/// fed to the open-bar aggregator and to price-dependent rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

impl Tick {
    /// Mid price used for bar formation and price-level rules
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// A finalized OHLCV bar. Immutable once its close time has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// Synthesize an empty bar covering a tick gap: OHLC all equal to the
    /// last known close, zero volume.
    pub fn synthetic_gap(symbol: &str, timeframe: Timeframe, open_time: i64, close: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        }
    }
}

/// The bar currently forming for a `(symbol, timeframe)`. Append-only until
/// the next period boundary, then finalized into an immutable [`Bar`].
#[derive(Debug, Clone)]
pub struct OpenBar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub tick_count: u64,
}

impl OpenBar {
    pub fn from_tick(tick: &Tick, timeframe: Timeframe) -> Self {
        let price = tick.mid();
        Self {
            symbol: tick.symbol.clone(),
            timeframe,
            open_time: timeframe.period_start(tick.timestamp),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
            tick_count: 1,
        }
    }

    /// Fold a tick into the forming bar. The caller guarantees the tick
    /// belongs to this bar's period.
    pub fn apply_tick(&mut self, tick: &Tick) {
        let price = tick.mid();
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += Decimal::ONE;
        self.tick_count += 1;
    }

    /// True when `timestamp_ms` lies at or beyond the next period boundary.
    pub fn is_closed_by(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.open_time + self.timeframe.to_millis()
    }

    pub fn finalize(self) -> Bar {
        Bar {
            symbol: self.symbol,
            timeframe: self.timeframe,
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}
