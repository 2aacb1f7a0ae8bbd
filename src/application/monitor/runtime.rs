use super::evaluation::{
    EvaluationInputs, LotBounds, evaluate_bar_close, trailing_signals, warmup_bars,
};
use crate::application::dispatcher::Dispatcher;
use crate::application::market_data::MarketStore;
use crate::application::safety::KillSwitch;
use crate::domain::command::{Command, CommandBody, Priority, SubmitRejection};
use crate::domain::strategy::{StrategyDefinition, StrategyStatus};
use crate::domain::trading::{Position, Signal, SignalAction};
use crate::infrastructure::bridge::BrokerStateCache;
use crate::infrastructure::event_bus::MarketBus;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub bounds: LotBounds,
    /// Hard ceiling per evaluation step
    pub evaluation_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bounds: LotBounds::default(),
            evaluation_timeout: Duration::from_millis(500),
        }
    }
}

/// Per-strategy readiness surfaced in `GetStatus` and heartbeats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRuntimeStatus {
    pub id: String,
    pub version: u64,
    pub status: StrategyStatus,
    pub warming_up: bool,
}

struct LoopShared {
    store: Arc<MarketStore>,
    bus: Arc<MarketBus>,
    broker: Arc<BrokerStateCache>,
    kill_switch: Arc<KillSwitch>,
    dispatcher: Arc<Dispatcher>,
    config: MonitorConfig,
    paused: AtomicBool,
}

struct StrategyHandle {
    slot: Arc<RwLock<Arc<StrategyDefinition>>>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Runs one cooperative evaluation loop per active strategy.
///
/// A loop is strictly serial with itself; distinct strategies run
/// concurrently. Hot reload swaps an immutable definition pointer that the
/// loop re-reads at each evaluation boundary, so an evaluation in progress
/// completes under the old definition.
pub struct StrategyMonitor {
    shared: Arc<LoopShared>,
    strategies: Mutex<HashMap<String, StrategyHandle>>,
}

impl StrategyMonitor {
    pub fn new(
        store: Arc<MarketStore>,
        bus: Arc<MarketBus>,
        broker: Arc<BrokerStateCache>,
        kill_switch: Arc<KillSwitch>,
        dispatcher: Arc<Dispatcher>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(LoopShared {
                store,
                bus,
                broker,
                kill_switch,
                dispatcher,
                config,
                paused: AtomicBool::new(false),
            }),
            strategies: Mutex::new(HashMap::new()),
        })
    }

    /// Load a new strategy or atomically hot-swap an existing one.
    /// Archived definitions unload the strategy.
    pub fn load(&self, def: StrategyDefinition) {
        let mut strategies = self
            .strategies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if def.status == StrategyStatus::Archived {
            if let Some(handle) = strategies.remove(&def.id) {
                info!("StrategyMonitor: unloading archived strategy {}", def.id);
                let _ = handle.stop_tx.send(true);
                handle.task.abort();
            }
            return;
        }

        match strategies.get(&def.id) {
            Some(handle) => {
                info!(
                    "StrategyMonitor: hot-swapping strategy {} to v{}",
                    def.id, def.version
                );
                let mut slot = handle
                    .slot
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *slot = Arc::new(def);
            }
            None => {
                info!(
                    "StrategyMonitor: loading strategy {} v{} ({:?})",
                    def.id, def.version, def.status
                );
                let id = def.id.clone();
                let slot = Arc::new(RwLock::new(Arc::new(def)));
                let (stop_tx, stop_rx) = watch::channel(false);
                let task = tokio::spawn(run_loop(self.shared.clone(), slot.clone(), stop_rx));
                strategies.insert(
                    id,
                    StrategyHandle {
                        slot,
                        stop_tx,
                        task,
                    },
                );
            }
        }
    }

    /// Suspend all evaluation loops after their current step.
    pub fn pause_all(&self) {
        info!("StrategyMonitor: paused");
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_all(&self) {
        info!("StrategyMonitor: resumed");
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        let strategies = self
            .strategies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        strategies
            .values()
            .filter(|h| current_def(&h.slot).status == StrategyStatus::Active)
            .count()
    }

    pub fn statuses(&self) -> Vec<StrategyRuntimeStatus> {
        let strategies = self
            .strategies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        strategies
            .values()
            .map(|handle| {
                let def = current_def(&handle.slot);
                let needed = warmup_bars(&def);
                let warming_up = def.symbols.iter().any(|symbol| {
                    self.shared.store.bar_count(symbol, def.timeframe) < needed
                });
                StrategyRuntimeStatus {
                    id: def.id.clone(),
                    version: def.version,
                    status: def.status,
                    warming_up,
                }
            })
            .collect()
    }

    /// Stop every loop; first step of the ordered shutdown (no new signals).
    pub fn shutdown(&self) {
        let mut strategies = self
            .strategies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, handle) in strategies.drain() {
            debug!("StrategyMonitor: stopping loop for {id}");
            let _ = handle.stop_tx.send(true);
            handle.task.abort();
        }
        info!("StrategyMonitor: all loops stopped");
    }
}

fn current_def(slot: &RwLock<Arc<StrategyDefinition>>) -> Arc<StrategyDefinition> {
    slot.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn should_evaluate(shared: &LoopShared, def: &StrategyDefinition) -> bool {
    def.status == StrategyStatus::Active
        && !shared.paused.load(Ordering::SeqCst)
        && !shared.kill_switch.is_active()
}

fn own_positions(broker: &BrokerStateCache, def: &StrategyDefinition, symbol: &str) -> Vec<Position> {
    broker
        .positions_for_magic(def.magic)
        .into_iter()
        .filter(|p| p.symbol == symbol)
        .collect()
}

async fn run_loop(
    shared: Arc<LoopShared>,
    slot: Arc<RwLock<Arc<StrategyDefinition>>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut bars = shared.bus.subscribe_bars().await;
    let mut ticks = shared.bus.subscribe_ticks();

    {
        let def = current_def(&slot);
        for symbol in &def.symbols {
            shared.store.subscribe_series(symbol, def.timeframe);
        }
        info!(
            "StrategyMonitor: loop for {} v{} running on {:?} {}",
            def.id, def.version, def.symbols, def.timeframe
        );
    }

    loop {
        tokio::select! {
            maybe_bar = bars.recv() => {
                let Some(bar) = maybe_bar else { break };
                // Evaluation boundary: a hot reload lands here.
                let def = current_def(&slot);
                for symbol in &def.symbols {
                    shared.store.subscribe_series(symbol, def.timeframe);
                }
                if !should_evaluate(&shared, &def)
                    || bar.timeframe != def.timeframe
                    || !def.symbols.iter().any(|s| s == &bar.symbol)
                {
                    continue;
                }
                evaluate_with_deadline(&shared, def, bar.symbol.clone()).await;
            }
            tick = ticks.recv() => {
                match tick {
                    Ok(tick) => {
                        let def = current_def(&slot);
                        if !should_evaluate(&shared, &def)
                            || !def.wants_ticks()
                            || !def.symbols.iter().any(|s| s == &tick.symbol)
                        {
                            continue;
                        }
                        tick_path(&shared, &def, &tick.symbol);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Ticks are best-effort by contract.
                        debug!("StrategyMonitor: tick stream lagged, missed {missed}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
}

/// Bar-close evaluation under the hard per-step ceiling. A step that blows
/// the deadline logs a slow-evaluation warning and yields no signals.
async fn evaluate_with_deadline(
    shared: &Arc<LoopShared>,
    def: Arc<StrategyDefinition>,
    symbol: String,
) {
    let strategy_positions = shared.broker.positions_for_magic(def.magic);
    let balance = shared
        .broker
        .account()
        .map(|a| a.balance)
        .unwrap_or_default();
    let bounds = shared.config.bounds;
    let store = shared.store.clone();
    let def_for_step = def.clone();
    let symbol_for_step = symbol.clone();

    let step = tokio::task::spawn_blocking(move || {
        evaluate_bar_close(&EvaluationInputs {
            def: &def_for_step,
            symbol: &symbol_for_step,
            store: &store,
            strategy_positions: &strategy_positions,
            balance,
            bounds,
            now_ms: Utc::now().timestamp_millis(),
        })
    });

    match tokio::time::timeout(shared.config.evaluation_timeout, step).await {
        Ok(Ok(signals)) => submit_signals(shared, &def, signals),
        Ok(Err(e)) => warn!("StrategyMonitor: evaluation task failed for {}: {e}", def.id),
        Err(_) => warn!(
            "StrategyMonitor: slow evaluation for {} on {symbol} exceeded {:?}, discarded",
            def.id, shared.config.evaluation_timeout
        ),
    }
}

/// Secondary trigger: trailing-stop maintenance and price-level rules.
fn tick_path(shared: &Arc<LoopShared>, def: &Arc<StrategyDefinition>, symbol: &str) {
    let own = own_positions(&shared.broker, def, symbol);
    let now_ms = Utc::now().timestamp_millis();

    let mut signals = trailing_signals(def, symbol, &shared.store, &own, now_ms);

    if def.entry_rule.references_price() || def.exit_rule.references_price() {
        let strategy_positions = shared.broker.positions_for_magic(def.magic);
        let balance = shared
            .broker
            .account()
            .map(|a| a.balance)
            .unwrap_or_default();
        signals.extend(evaluate_bar_close(&EvaluationInputs {
            def,
            symbol,
            store: &shared.store,
            strategy_positions: &strategy_positions,
            balance,
            bounds: shared.config.bounds,
            now_ms,
        }));
    }

    submit_signals(shared, def, signals);
}

fn submit_signals(shared: &Arc<LoopShared>, def: &StrategyDefinition, signals: Vec<Signal>) {
    for signal in signals {
        let command = command_for(def, &signal);
        let id = command.id.clone();
        match shared.dispatcher.submit(command) {
            Ok(()) => {
                debug!(
                    "StrategyMonitor: {} signal on {} submitted as {id}",
                    def.id, signal.symbol
                );
            }
            Err(SubmitRejection::KillSwitchActive) => {
                warn!(
                    "StrategyMonitor: signal from {} rejected, kill switch active",
                    def.id
                );
            }
            Err(e) => {
                warn!("StrategyMonitor: signal from {} rejected: {e}", def.id);
            }
        }
    }
}

/// Translate a validated signal into a High-priority command.
fn command_for(def: &StrategyDefinition, signal: &Signal) -> Command {
    let body = match &signal.action {
        SignalAction::Open {
            side,
            volume,
            stop_loss,
            take_profit,
        } => CommandBody::OpenPosition {
            symbol: signal.symbol.clone(),
            side: *side,
            volume: *volume,
            stop_loss: *stop_loss,
            take_profit: *take_profit,
            magic: def.magic,
        },
        SignalAction::Close { ticket } => CommandBody::ClosePosition { ticket: *ticket },
        SignalAction::Modify {
            ticket,
            stop_loss,
            take_profit,
        } => CommandBody::ModifyPosition {
            ticket: *ticket,
            stop_loss: *stop_loss,
            take_profit: *take_profit,
        },
    };
    Command {
        id: format!("sig-{}", Uuid::new_v4()),
        body,
        priority: Priority::High,
        created_at: signal.timestamp,
        expires_at: None,
        requester_id: signal.strategy_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatcher::{CommandRouter, DispatcherConfig};
    use crate::domain::command::CommandOutcome;
    use crate::domain::errors::ExecutorError;
    use crate::domain::market::{Tick, Timeframe};
    use crate::domain::strategy::{CompareOp, Operand, RuleNode, Sizing};
    use crate::domain::trading::OrderSide;
    use crate::infrastructure::observability::ExecutorMetrics;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    const BASE: i64 = 1704067200000;

    struct NullRouter;

    #[async_trait]
    impl CommandRouter for NullRouter {
        async fn execute(&self, _cmd: &Command) -> Result<serde_json::Value, ExecutorError> {
            Ok(serde_json::Value::Null)
        }
    }

    struct Fixture {
        monitor: Arc<StrategyMonitor>,
        store: Arc<MarketStore>,
        bus: Arc<MarketBus>,
        broker: Arc<BrokerStateCache>,
        kill_switch: Arc<KillSwitch>,
        outcomes: mpsc::Receiver<CommandOutcome>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MarketStore::new(500));
        let bus = Arc::new(MarketBus::new());
        let broker = Arc::new(BrokerStateCache::new());
        let kill_switch = Arc::new(KillSwitch::new());
        let (outcome_tx, outcomes) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(
            DispatcherConfig::default(),
            kill_switch.clone(),
            Arc::new(NullRouter),
            outcome_tx,
            ExecutorMetrics::new().unwrap(),
            HashSet::new(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        std::mem::forget(shutdown_tx);
        tokio::spawn(dispatcher.clone().run(shutdown_rx));

        let monitor = StrategyMonitor::new(
            store.clone(),
            bus.clone(),
            broker.clone(),
            kill_switch.clone(),
            dispatcher,
            MonitorConfig::default(),
        );
        Fixture {
            monitor,
            store,
            bus,
            broker,
            kill_switch,
            outcomes,
        }
    }

    fn always() -> RuleNode {
        RuleNode::Compare {
            left: Operand::Value(1.0),
            op: CompareOp::Gt,
            right: Operand::Value(0.0),
        }
    }

    fn never() -> RuleNode {
        RuleNode::Compare {
            left: Operand::Value(0.0),
            op: CompareOp::Gt,
            right: Operand::Value(1.0),
        }
    }

    fn active_def(id: &str) -> StrategyDefinition {
        StrategyDefinition {
            id: id.to_string(),
            version: 1,
            symbols: vec!["EURUSD".to_string()],
            timeframe: Timeframe::M1,
            side: OrderSide::Buy,
            entry_rule: always(),
            exit_rule: never(),
            filters: vec![],
            sizing: Sizing::FixedLots { lots: dec!(0.1) },
            status: StrategyStatus::Active,
            max_open_positions: 1,
            magic: 7,
            trailing_stop: None,
        }
    }

    async fn drive_bar_close(fixture: &Fixture, minute: i64) {
        let price = Decimal::from_f64(1.10 + minute as f64 * 0.001).unwrap();
        let closed = fixture.store.ingest_tick(&Tick {
            symbol: "EURUSD".to_string(),
            bid: price,
            ask: price,
            timestamp: BASE + minute * 60_000,
        });
        for bar in closed {
            fixture.bus.publish_bar(bar).await;
        }
    }

    #[tokio::test]
    async fn test_bar_close_drives_entry_signal() {
        let mut f = fixture();
        f.broker.set_account(crate::domain::trading::AccountSnapshot {
            balance: dec!(10000),
            equity: dec!(10000),
            margin: Decimal::ZERO,
            free_margin: dec!(10000),
            margin_level: Decimal::ZERO,
            currency: "USD".to_string(),
        });
        f.monitor.load(active_def("s-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        drive_bar_close(&f, 0).await;
        drive_bar_close(&f, 1).await;

        let outcome =
            tokio::time::timeout(Duration::from_secs(2), f.outcomes.recv())
                .await
                .expect("no command reached the dispatcher")
                .unwrap();
        assert_eq!(outcome.kind, crate::domain::command::CommandKind::OpenPosition);
        assert_eq!(f.monitor.active_count(), 1);
    }

    #[tokio::test]
    async fn test_kill_switch_suspends_loops() {
        let mut f = fixture();
        f.monitor.load(active_def("s-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.kill_switch.engage("test");
        // Drain the automatic CloseAll outcome.
        let first = tokio::time::timeout(Duration::from_secs(2), f.outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, crate::domain::command::CommandKind::CloseAll);

        drive_bar_close(&f, 0).await;
        drive_bar_close(&f, 1).await;

        // No entry signal while halted.
        let res = tokio::time::timeout(Duration::from_millis(300), f.outcomes.recv()).await;
        assert!(res.is_err(), "strategy evaluated while kill switch active");
    }

    #[tokio::test]
    async fn test_hot_reload_swaps_definition() {
        let mut f = fixture();
        f.monitor.load(active_def("s-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // v2 never enters.
        let mut v2 = active_def("s-1");
        v2.version = 2;
        v2.entry_rule = never();
        f.monitor.load(v2);

        drive_bar_close(&f, 0).await;
        drive_bar_close(&f, 1).await;

        let res = tokio::time::timeout(Duration::from_millis(300), f.outcomes.recv()).await;
        assert!(res.is_err(), "old definition fired after hot reload");

        let statuses = f.monitor.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].version, 2);
    }

    #[tokio::test]
    async fn test_archived_strategy_unloads() {
        let f = fixture();
        f.monitor.load(active_def("s-1"));
        assert_eq!(f.monitor.active_count(), 1);

        let mut archived = active_def("s-1");
        archived.status = StrategyStatus::Archived;
        f.monitor.load(archived);
        assert_eq!(f.monitor.active_count(), 0);
        assert!(f.monitor.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let mut f = fixture();
        f.monitor.load(active_def("s-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.monitor.pause_all();
        drive_bar_close(&f, 0).await;
        drive_bar_close(&f, 1).await;
        let res = tokio::time::timeout(Duration::from_millis(300), f.outcomes.recv()).await;
        assert!(res.is_err(), "paused strategy still evaluated");

        f.monitor.resume_all();
        drive_bar_close(&f, 2).await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), f.outcomes.recv())
            .await
            .expect("no signal after resume")
            .unwrap();
        assert_eq!(outcome.kind, crate::domain::command::CommandKind::OpenPosition);
    }
}
