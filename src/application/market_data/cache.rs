use crate::domain::market::Timeframe;
use crate::domain::strategy::IndicatorSpec;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default cap on total cached values before eviction kicks in.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Memoization key: one entry per indicator per finalized bar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub spec: IndicatorSpec,
    /// Open time of the last finalized bar the value was computed on
    pub bar_open_time: i64,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: f64,
    last_access: u64,
}

/// Concurrent indicator value cache: single writer (the market-data store's
/// stream consumer invalidates), many lock-free readers. Values stay valid
/// until a new bar on their `(symbol, timeframe)` is finalized.
pub struct IndicatorCache {
    entries: DashMap<CacheKey, CacheEntry>,
    access_clock: AtomicU64,
    max_entries: usize,
}

impl IndicatorCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            access_clock: AtomicU64::new(0),
            max_entries,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<f64> {
        let stamp = self.access_clock.fetch_add(1, Ordering::Relaxed);
        self.entries.get_mut(key).map(|mut entry| {
            entry.last_access = stamp;
            entry.value
        })
    }

    pub fn insert(&self, key: CacheKey, value: f64) {
        let stamp = self.access_clock.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: stamp,
            },
        );
        if self.entries.len() > self.max_entries {
            self.evict();
        }
    }

    /// Drop every entry for `(symbol, timeframe)` computed on a bar older
    /// than `open_time`. Runs atomically per bar-close event, before any
    /// strategy observes the new bar; other timeframes are unaffected.
    pub fn invalidate_before(&self, symbol: &str, timeframe: Timeframe, open_time: i64) {
        self.entries.retain(|key, _| {
            !(key.symbol == symbol && key.timeframe == timeframe && key.bar_open_time < open_time)
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Evict the least recently accessed tenth of the cache.
    fn evict(&self) {
        let mut stamps: Vec<u64> = self.entries.iter().map(|e| e.last_access).collect();
        stamps.sort_unstable();
        let cutoff_index = stamps.len() / 10;
        let cutoff = stamps.get(cutoff_index).copied().unwrap_or(0);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_access > cutoff);
        debug!(
            "IndicatorCache: evicted {} of {} entries",
            before - self.entries.len(),
            before
        );
    }
}

impl Default for IndicatorCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
