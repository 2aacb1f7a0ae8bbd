mod cache;
mod ring;
mod store;

pub use cache::{CacheKey, DEFAULT_MAX_ENTRIES, IndicatorCache};
pub use ring::RingBuffer;
pub use store::{MIN_RING_CAPACITY, MarketStore, WindowSnapshot};
