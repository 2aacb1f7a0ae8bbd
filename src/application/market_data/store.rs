use super::cache::{CacheKey, IndicatorCache};
use super::ring::RingBuffer;
use crate::application::indicators;
use crate::domain::market::{Bar, OpenBar, Tick, Timeframe};
use crate::domain::strategy::{IndicatorSource, IndicatorSpec};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Floor on per-series ring capacity regardless of configuration.
pub const MIN_RING_CAPACITY: usize = 500;

type SeriesKey = (String, Timeframe);

/// Immutable view over a series' finalized bars, republished on every bar
/// close. Readers always observe a consistent `(bars, last bar)` pair.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub bars: Vec<Bar>,
    pub last_open_time: i64,
}

struct SeriesState {
    ring: RingBuffer<Bar>,
    open: Option<OpenBar>,
}

/// Exclusive owner of all rolling windows and the indicator cache.
///
/// Writes happen on one logical stream (the broker stream consumer), which
/// preserves per-symbol monotonicity of tick timestamps; the write-side
/// mutex is therefore uncontended. Readers never take it: they work off
/// `Arc<WindowSnapshot>` values published through a concurrent map.
pub struct MarketStore {
    capacity: usize,
    series: Mutex<HashMap<SeriesKey, SeriesState>>,
    snapshots: DashMap<SeriesKey, Arc<WindowSnapshot>>,
    prices: DashMap<String, Tick>,
    cache: IndicatorCache,
    subscriptions: RwLock<HashMap<String, BTreeSet<Timeframe>>>,
}

impl MarketStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(MIN_RING_CAPACITY),
            series: Mutex::new(HashMap::new()),
            snapshots: DashMap::new(),
            prices: DashMap::new(),
            cache: IndicatorCache::default(),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Register interest in a `(symbol, timeframe)` series. Called by the
    /// strategy monitor when a strategy loads; ticks for unsubscribed
    /// series only refresh the price cache.
    pub fn subscribe_series(&self, symbol: &str, timeframe: Timeframe) {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.entry(symbol.to_string()).or_default().insert(timeframe);
    }

    /// Fold one tick into every subscribed series of its symbol. Returns the
    /// bars this tick finalized (already invalidated in the cache and
    /// published as fresh snapshots), oldest first.
    pub fn ingest_tick(&self, tick: &Tick) -> Vec<Bar> {
        self.prices.insert(tick.symbol.clone(), tick.clone());

        let timeframes: Vec<Timeframe> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match subs.get(&tick.symbol) {
                Some(set) => set.iter().copied().collect(),
                None => return Vec::new(),
            }
        };

        let mut finalized = Vec::new();
        let mut series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        for timeframe in timeframes {
            let key = (tick.symbol.clone(), timeframe);
            let state = series.entry(key.clone()).or_insert_with(|| SeriesState {
                ring: RingBuffer::new(self.capacity),
                open: None,
            });

            match &mut state.open {
                None => {
                    state.open = Some(OpenBar::from_tick(tick, timeframe));
                }
                Some(open) if !open.is_closed_by(tick.timestamp) => {
                    open.apply_tick(tick);
                }
                Some(_) => {
                    let open = state
                        .open
                        .take()
                        .expect("open bar verified to exist by match");
                    let closed = self.close_out(state, open, tick.timestamp);
                    state.open = Some(OpenBar::from_tick(tick, timeframe));
                    self.publish_snapshot(&key, state);
                    finalized.extend(closed);
                }
            }
        }
        finalized
    }

    /// Accept an authoritative bar-close frame from the bridge. Returns the
    /// newly finalized bars (gap synthesis included), or empty when the bar
    /// is stale or already known.
    pub fn ingest_broker_bar(&self, bar: Bar) -> Vec<Bar> {
        let key = (bar.symbol.clone(), bar.timeframe);
        let mut series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        let state = series.entry(key.clone()).or_insert_with(|| SeriesState {
            ring: RingBuffer::new(self.capacity),
            open: None,
        });

        if state
            .ring
            .last()
            .is_some_and(|last| last.open_time >= bar.open_time)
        {
            debug!(
                "MarketStore: dropping stale broker bar {}@{} openTime={}",
                bar.symbol, bar.timeframe, bar.open_time
            );
            return Vec::new();
        }

        let mut closed = Vec::new();
        if let Some(last) = state.ring.last().cloned() {
            closed.extend(self.gap_bars(
                &bar.symbol,
                bar.timeframe,
                last.open_time + bar.timeframe.to_millis(),
                bar.open_time,
                last.close,
            ));
        }
        closed.push(bar.clone());
        for b in &closed {
            state.ring.push(b.clone());
        }

        // The broker's close supersedes our locally forming bar for the
        // same (or an earlier) period.
        if state
            .open
            .as_ref()
            .is_some_and(|open| open.open_time <= bar.open_time)
        {
            state.open = None;
        }

        self.publish_snapshot(&key, state);
        closed
    }

    /// Read contract of the indicator library: `None` when there is not
    /// enough history. Reads are lock-free; values are memoized until a new
    /// bar on this `(symbol, timeframe)` is finalized.
    pub fn value(&self, symbol: &str, timeframe: Timeframe, spec: &IndicatorSpec) -> Option<f64> {
        let snapshot = self.window(symbol, timeframe)?;
        if snapshot.bars.len() < indicators::required_bars(spec) {
            return None;
        }

        let key = CacheKey {
            symbol: symbol.to_string(),
            timeframe,
            spec: spec.clone(),
            bar_open_time: snapshot.last_open_time,
        };
        if let Some(value) = self.cache.get(&key) {
            return Some(value);
        }
        let value = indicators::compute(spec, &snapshot.bars)?;
        self.cache.insert(key, value);
        Some(value)
    }

    pub fn window(&self, symbol: &str, timeframe: Timeframe) -> Option<Arc<WindowSnapshot>> {
        self.snapshots
            .get(&(symbol.to_string(), timeframe))
            .map(|entry| entry.value().clone())
    }

    pub fn latest_tick(&self, symbol: &str) -> Option<Tick> {
        self.prices.get(symbol).map(|entry| entry.value().clone())
    }

    pub fn bar_count(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.window(symbol, timeframe)
            .map(|s| s.bars.len())
            .unwrap_or(0)
    }

    /// Log returns over the last `lookback` finalized closes, oldest first.
    /// Used by the safety validator's correlation check.
    pub fn log_returns(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Option<Vec<f64>> {
        let snapshot = self.window(symbol, timeframe)?;
        if snapshot.bars.len() < lookback + 1 {
            return None;
        }
        let closes: Vec<f64> = snapshot.bars[snapshot.bars.len() - lookback - 1..]
            .iter()
            .map(|b| b.close.to_f64().unwrap_or(0.0))
            .collect();
        let returns: Vec<f64> = closes
            .windows(2)
            .map(|w| {
                if w[0] > 0.0 && w[1] > 0.0 {
                    (w[1] / w[0]).ln()
                } else {
                    0.0
                }
            })
            .collect();
        Some(returns)
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &IndicatorCache {
        &self.cache
    }

    /// Finalize `open`, synthesizing empty bars over any tick gap, pushing
    /// everything into the ring and invalidating the cache. Snapshot
    /// publication is the caller's job (it may still mutate the state).
    fn close_out(&self, state: &mut SeriesState, open: OpenBar, now_ms: i64) -> Vec<Bar> {
        let timeframe = open.timeframe;
        let symbol = open.symbol.clone();
        let last_close = open.close;
        let first_open_time = open.open_time;

        let mut closed = vec![open.finalize()];
        closed.extend(self.gap_bars(
            &symbol,
            timeframe,
            first_open_time + timeframe.to_millis(),
            timeframe.period_start(now_ms),
            last_close,
        ));

        for bar in &closed {
            state.ring.push(bar.clone());
        }
        closed
    }

    /// Synthetic bars for `[from, until)` period opens, capped at ring
    /// capacity (anything older would be evicted immediately anyway).
    fn gap_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        mut from: i64,
        until: i64,
        close: rust_decimal::Decimal,
    ) -> Vec<Bar> {
        let step = timeframe.to_millis();
        if from >= until {
            return Vec::new();
        }
        let missing = ((until - from) / step) as usize;
        if missing > self.capacity {
            from = until - (self.capacity as i64) * step;
        }
        let mut bars = Vec::new();
        while from < until {
            bars.push(Bar::synthetic_gap(symbol, timeframe, from, close));
            from += step;
        }
        bars
    }

    fn publish_snapshot(&self, key: &SeriesKey, state: &SeriesState) {
        let bars = state.ring.to_vec();
        let last_open_time = bars.last().map(|b| b.open_time).unwrap_or(0);
        // Invalidate strictly before publishing so no strategy can pair the
        // new bar with a value computed on the old window.
        self.cache
            .invalidate_before(&key.0, key.1, last_open_time);
        self.snapshots.insert(
            key.clone(),
            Arc::new(WindowSnapshot {
                bars,
                last_open_time,
            }),
        );
    }
}

impl IndicatorSource for MarketStore {
    fn indicator(&self, symbol: &str, timeframe: Timeframe, spec: &IndicatorSpec) -> Option<f64> {
        self.value(symbol, timeframe, spec)
    }

    fn price(&self, symbol: &str) -> Option<f64> {
        self.latest_tick(symbol).and_then(|t| t.mid().to_f64())
    }
}
