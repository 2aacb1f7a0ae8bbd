use crate::domain::market::{Bar, Tick};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::debug;

const TICK_CHANNEL_CAPACITY: usize = 1024;
const BAR_CHANNEL_CAPACITY: usize = 64;

/// Fan-out bus for market events.
///
/// Ticks ride a `broadcast` channel: best-effort, slow subscribers observe
/// `Lagged` and simply miss ticks. Bar closes are must-deliver: every
/// subscriber gets its own bounded `mpsc` channel and the publisher awaits
/// capacity, so a bar close is never dropped.
pub struct MarketBus {
    tick_tx: broadcast::Sender<Tick>,
    bar_subs: RwLock<Vec<mpsc::Sender<Bar>>>,
}

impl MarketBus {
    pub fn new() -> Self {
        let (tick_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        Self {
            tick_tx,
            bar_subs: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<Tick> {
        self.tick_tx.subscribe()
    }

    pub async fn subscribe_bars(&self) -> mpsc::Receiver<Bar> {
        let (tx, rx) = mpsc::channel(BAR_CHANNEL_CAPACITY);
        self.bar_subs.write().await.push(tx);
        rx
    }

    /// Best-effort tick publication; no subscribers is not an error.
    pub fn publish_tick(&self, tick: Tick) {
        let _ = self.tick_tx.send(tick);
    }

    /// Must-deliver bar publication in arrival order. Suspends on a full
    /// subscriber channel; closed subscribers are pruned.
    pub async fn publish_bar(&self, bar: Bar) {
        let mut any_closed = false;
        {
            let subs = self.bar_subs.read().await;
            for sub in subs.iter() {
                if sub.send(bar.clone()).await.is_err() {
                    any_closed = true;
                }
            }
        }
        if any_closed {
            let mut subs = self.bar_subs.write().await;
            let before = subs.len();
            subs.retain(|s| !s.is_closed());
            debug!(
                "MarketBus: pruned {} closed bar subscriber(s)",
                before - subs.len()
            );
        }
    }

    pub async fn bar_subscriber_count(&self) -> usize {
        self.bar_subs.read().await.len()
    }
}

impl Default for MarketBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Timeframe;
    use rust_decimal_macros::dec;

    fn tick(ts: i64) -> Tick {
        Tick {
            symbol: "EURUSD".to_string(),
            bid: dec!(1.1),
            ask: dec!(1.1002),
            timestamp: ts,
        }
    }

    fn bar(open_time: i64) -> Bar {
        Bar {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M1,
            open_time,
            open: dec!(1.1),
            high: dec!(1.1),
            low: dec!(1.1),
            close: dec!(1.1),
            volume: dec!(1),
        }
    }

    #[tokio::test]
    async fn test_tick_fanout() {
        let bus = MarketBus::new();
        let mut rx1 = bus.subscribe_ticks();
        let mut rx2 = bus.subscribe_ticks();

        bus.publish_tick(tick(1));

        assert_eq!(rx1.recv().await.unwrap().timestamp, 1);
        assert_eq!(rx2.recv().await.unwrap().timestamp, 1);
    }

    #[tokio::test]
    async fn test_bar_close_must_deliver_in_order() {
        let bus = MarketBus::new();
        let mut rx = bus.subscribe_bars().await;

        for i in 0..10 {
            bus.publish_bar(bar(i * 60_000)).await;
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().open_time, i * 60_000);
        }
    }

    #[tokio::test]
    async fn test_closed_bar_subscriber_pruned() {
        let bus = MarketBus::new();
        let rx = bus.subscribe_bars().await;
        let _rx2 = bus.subscribe_bars().await;
        assert_eq!(bus.bar_subscriber_count().await, 2);

        drop(rx);
        bus.publish_bar(bar(0)).await;
        assert_eq!(bus.bar_subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_lagged_tick_subscriber_keeps_receiving() {
        let bus = MarketBus::new();
        let mut rx = bus.subscribe_ticks();

        // Overflow the broadcast buffer.
        for i in 0..(TICK_CHANNEL_CAPACITY as i64 + 100) {
            bus.publish_tick(tick(i));
        }

        // First recv reports the lag, subsequent recvs deliver fresh ticks.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed >= 100),
            other => panic!("expected Lagged, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }
}
