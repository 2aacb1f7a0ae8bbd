use super::protocol::StreamFrame;
use super::state::BrokerStateCache;
use crate::application::market_data::MarketStore;
use crate::domain::trading::FillNotice;
use crate::infrastructure::event_bus::MarketBus;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Single consumer of the broker stream socket.
///
/// Frames are processed strictly in arrival order on one logical stream,
/// which preserves per-symbol monotonicity of tick timestamps. Each frame
/// first updates the owning store/cache, then fans out on the bus, so a
/// subscriber never observes an event before the state behind it.
pub struct StreamConsumer {
    store: Arc<MarketStore>,
    bus: Arc<MarketBus>,
    cache: Arc<BrokerStateCache>,
    fill_tx: mpsc::Sender<FillNotice>,
}

impl StreamConsumer {
    pub fn new(
        store: Arc<MarketStore>,
        bus: Arc<MarketBus>,
        cache: Arc<BrokerStateCache>,
        fill_tx: mpsc::Sender<FillNotice>,
    ) -> Self {
        Self {
            store,
            bus,
            cache,
            fill_tx,
        }
    }

    pub async fn handle_frame(&self, frame: StreamFrame) {
        match frame {
            StreamFrame::Tick(tick) => {
                let closed = self.store.ingest_tick(&tick);
                // Bar closes fan out before the tick that caused them.
                for bar in closed {
                    self.bus.publish_bar(bar).await;
                }
                self.bus.publish_tick(tick);
            }
            StreamFrame::BarClose { bar, .. } => {
                for bar in self.store.ingest_broker_bar(bar) {
                    self.bus.publish_bar(bar).await;
                }
            }
            StreamFrame::PositionUpdate { positions } => {
                debug!("StreamConsumer: {} open position(s)", positions.len());
                self.cache.set_positions(positions);
            }
            StreamFrame::AccountSnapshot(snapshot) => {
                self.cache.set_account(snapshot);
            }
            StreamFrame::FillNotice(fill) => {
                if self.fill_tx.try_send(fill).is_err() {
                    // The periodic position sync will cover for the missed
                    // trigger.
                    warn!("StreamConsumer: fill notification channel full, dropping trigger");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Tick, Timeframe};
    use crate::domain::trading::AccountSnapshot;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const BASE: i64 = 1704067200000;

    fn consumer() -> (
        StreamConsumer,
        Arc<MarketStore>,
        Arc<MarketBus>,
        Arc<BrokerStateCache>,
        mpsc::Receiver<FillNotice>,
    ) {
        let store = Arc::new(MarketStore::new(500));
        let bus = Arc::new(MarketBus::new());
        let cache = Arc::new(BrokerStateCache::new());
        let (fill_tx, fill_rx) = mpsc::channel(16);
        let consumer = StreamConsumer::new(store.clone(), bus.clone(), cache.clone(), fill_tx);
        (consumer, store, bus, cache, fill_rx)
    }

    fn tick(price: Decimal, ts: i64) -> StreamFrame {
        StreamFrame::Tick(Tick {
            symbol: "EURUSD".to_string(),
            bid: price,
            ask: price,
            timestamp: ts,
        })
    }

    #[tokio::test]
    async fn test_tick_updates_store_and_bus() {
        let (consumer, store, bus, _cache, _fills) = consumer();
        store.subscribe_series("EURUSD", Timeframe::M1);
        let mut ticks = bus.subscribe_ticks();
        let mut bars = bus.subscribe_bars().await;

        consumer.handle_frame(tick(dec!(1.10), BASE)).await;
        consumer.handle_frame(tick(dec!(1.11), BASE + 60_000)).await;

        assert_eq!(ticks.recv().await.unwrap().timestamp, BASE);
        // Boundary tick published the finalized bar.
        let bar = bars.recv().await.unwrap();
        assert_eq!(bar.open_time, BASE);
        assert_eq!(store.bar_count("EURUSD", Timeframe::M1), 1);
    }

    #[tokio::test]
    async fn test_account_and_positions_update_cache() {
        let (consumer, _store, _bus, cache, _fills) = consumer();

        consumer
            .handle_frame(StreamFrame::AccountSnapshot(AccountSnapshot {
                balance: dec!(5000),
                equity: dec!(5100),
                margin: Decimal::ZERO,
                free_margin: dec!(5100),
                margin_level: Decimal::ZERO,
                currency: "USD".to_string(),
            }))
            .await;
        assert_eq!(cache.account().unwrap().equity, dec!(5100));

        consumer
            .handle_frame(StreamFrame::PositionUpdate { positions: vec![] })
            .await;
        assert_eq!(cache.open_position_count(), 0);
    }

    #[tokio::test]
    async fn test_fill_notice_forwarded() {
        let (consumer, _store, _bus, _cache, mut fills) = consumer();
        consumer
            .handle_frame(StreamFrame::FillNotice(FillNotice {
                ticket: 9,
                price: dec!(1.1),
                volume: dec!(0.1),
                timestamp: BASE,
            }))
            .await;
        assert_eq!(fills.recv().await.unwrap().ticket, 9);
    }
}
