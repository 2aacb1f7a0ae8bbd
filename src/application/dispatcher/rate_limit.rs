use crate::domain::command::KindFamily;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket: `capacity` requests per `window`, refilled continuously.
///
/// A refused acquire reports how long until the next token so the caller
/// can defer instead of spinning.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(0.001),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or learn how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    #[cfg(test)]
    fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        state.tokens = 0.0;
        state.last_refill = Instant::now();
    }
}

/// One bucket per kind family; the families are limited independently.
pub struct RateLimiters {
    trade: TokenBucket,
    read: TokenBucket,
    control: TokenBucket,
}

impl RateLimiters {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            trade: TokenBucket::new(capacity, window),
            read: TokenBucket::new(capacity, window),
            control: TokenBucket::new(capacity, window),
        }
    }

    pub fn try_acquire(&self, family: KindFamily) -> Result<(), Duration> {
        match family {
            KindFamily::TradeMutating => self.trade.try_acquire(),
            KindFamily::Read => self.read.try_acquire(),
            KindFamily::Control => self.control.try_acquire(),
        }
    }
}
