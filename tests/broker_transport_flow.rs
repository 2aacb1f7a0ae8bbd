//! Broker transport scenarios against an in-process bridge simulator:
//! happy-path open/close and reconnect with in-flight loss.

mod support;

use fx_executor::application::market_data::MarketStore;
use fx_executor::application::safety::KillSwitch;
use fx_executor::application::supervisor::ConnectionSupervisor;
use fx_executor::domain::errors::{ExecutorError, TransportError};
use fx_executor::domain::market::{Tick, Timeframe};
use fx_executor::domain::trading::OrderSide;
use fx_executor::infrastructure::bridge::{BrokerStateCache, BrokerTransport, StreamConsumer, StreamFrame};
use fx_executor::infrastructure::event_bus::MarketBus;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use support::{MockBroker, wait_until};
use tokio::sync::{mpsc, watch};

struct Rig {
    broker: MockBroker,
    transport: Arc<BrokerTransport>,
    cache: Arc<BrokerStateCache>,
    store: Arc<MarketStore>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn rig() -> Rig {
    let broker = MockBroker::start().await;
    let cache = Arc::new(BrokerStateCache::new());
    let store = Arc::new(MarketStore::new(500));
    let bus = Arc::new(MarketBus::new());
    let (fill_tx, _fill_rx) = mpsc::channel(16);
    let consumer = Arc::new(StreamConsumer::new(
        store.clone(),
        bus,
        cache.clone(),
        fill_tx,
    ));
    let kill_switch = Arc::new(KillSwitch::new());
    let (supervisor, _fatal) = ConnectionSupervisor::new(kill_switch);

    let transport = Arc::new(BrokerTransport::new(
        broker.rpc_addr.clone(),
        broker.stream_addr.clone(),
        cache.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(
        transport
            .clone()
            .run(consumer, supervisor, shutdown_rx),
    );

    let ready = {
        let transport = transport.clone();
        wait_until(Duration::from_secs(5), move || transport.is_trade_ready()).await
    };
    assert!(ready, "transport never synchronized with the mock bridge");

    Rig {
        broker,
        transport,
        cache,
        store,
        _shutdown_tx: shutdown_tx,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_then_close_happy_path() {
    let rig = rig().await;

    // Resync installed the account snapshot before trades were accepted.
    assert!(rig.cache.account().is_some());

    let result = rig
        .transport
        .open_position(
            "EURUSD".to_string(),
            OrderSide::Buy,
            dec!(0.1),
            None,
            None,
            7,
        )
        .await
        .unwrap();
    let ticket = result["ticket"].as_u64().unwrap();
    assert_eq!(rig.broker.open_count(), 1);

    // The bridge streams the position update back.
    let cache = rig.cache.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            cache.open_position_count() == 1
        })
        .await
    );
    assert_eq!(rig.cache.find_by_ticket(ticket).unwrap().magic, 7);

    rig.transport.close_position(ticket).await.unwrap();
    assert_eq!(rig.broker.position_count(), 0);
    let cache = rig.cache.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            cache.open_position_count() == 0
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_logical_reject_surfaces() {
    let rig = rig().await;
    let err = rig.transport.close_position(999_999).await.unwrap_err();
    match err {
        ExecutorError::BrokerReject { code, .. } => assert_eq!(code, 4108),
        other => panic!("expected broker reject, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_ticks_reach_the_store() {
    let rig = rig().await;
    rig.store.subscribe_series("EURUSD", Timeframe::M1);

    let base = 1704067200000i64;
    for i in 0..3 {
        rig.broker.push_frame(StreamFrame::Tick(Tick {
            symbol: "EURUSD".to_string(),
            bid: dec!(1.1000),
            ask: dec!(1.1002),
            timestamp: base + i * 60_000,
        }));
    }

    let store = rig.store.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            store.bar_count("EURUSD", Timeframe::M1) == 2
        })
        .await,
        "ticks did not form bars in the store"
    );
    assert!(rig.store.latest_tick("EURUSD").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_fails_in_flight_then_recovers() {
    let rig = rig().await;

    // Outstanding OPEN that the bridge will never answer.
    rig.broker.sim.lock().unwrap().stall_opens = true;
    let transport = rig.transport.clone();
    let in_flight = tokio::spawn(async move {
        transport
            .open_position(
                "EURUSD".to_string(),
                OrderSide::Buy,
                dec!(0.1),
                None,
                None,
                0,
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Socket dies under the request: the waiter fails with Disconnected.
    rig.broker.kill_connections();
    let err = in_flight.await.unwrap().unwrap_err();
    assert_eq!(
        err.kind_tag(),
        ExecutorError::Transport(TransportError::Disconnected).kind_tag()
    );
    assert!(err.is_retryable());

    // Transport reconnects with backoff and re-synchronizes.
    rig.broker.sim.lock().unwrap().stall_opens = false;
    let transport = rig.transport.clone();
    assert!(
        wait_until(Duration::from_secs(10), move || transport.is_trade_ready()).await,
        "transport did not recover after reconnect"
    );

    // The retried open now succeeds.
    let result = rig
        .transport
        .open_position(
            "EURUSD".to_string(),
            OrderSide::Buy,
            dec!(0.1),
            None,
            None,
            0,
        )
        .await
        .unwrap();
    assert!(result["ticket"].as_u64().is_some());
}
