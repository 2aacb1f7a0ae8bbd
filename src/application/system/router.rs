use crate::application::dispatcher::{CommandRouter, Dispatcher};
use crate::application::market_data::MarketStore;
use crate::application::monitor::StrategyMonitor;
use crate::application::safety::{
    CorrelationInputs, EquityTracker, KillSwitch, ValidationContext, validate_signal,
};
use crate::application::supervisor::{ConnectionSupervisor, Link};
use crate::domain::command::{Command, CommandBody};
use crate::domain::errors::ExecutorError;
use crate::domain::market::Timeframe;
use crate::domain::safety::SafetyLimits;
use crate::domain::strategy::StrategyStatus;
use crate::domain::trading::{OrderSide, Signal, SignalAction};
use crate::infrastructure::bridge::{BrokerStateCache, BrokerTransport};
use crate::infrastructure::observability::ExecutorMetrics;
use crate::infrastructure::persistence::StrategyRepository;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Timeframe the correlation check measures returns on.
const CORRELATION_TIMEFRAME: Timeframe = Timeframe::H1;

/// Routes each dequeued command to its owning subsystem.
///
/// Trade mutations go to the broker transport, with the pre-trade safety
/// validator run exactly once immediately before dispatch (for both
/// strategy signals and control-plane commands). Control kinds go to the
/// kill switch and the strategy monitor; reads assemble a status snapshot.
pub struct ExecutorRouter {
    transport: Arc<BrokerTransport>,
    kill_switch: Arc<KillSwitch>,
    broker: Arc<BrokerStateCache>,
    store: Arc<MarketStore>,
    tracker: Arc<EquityTracker>,
    supervisor: Arc<ConnectionSupervisor>,
    metrics: ExecutorMetrics,
    strategy_repo: Arc<StrategyRepository>,
    limits: SafetyLimits,
    correlation_lookback: usize,
    // Set after construction; the monitor and dispatcher depend on the
    // router, so the graph has one deferred edge each.
    monitor: OnceLock<Arc<StrategyMonitor>>,
    dispatcher: OnceLock<Arc<Dispatcher>>,
}

impl ExecutorRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<BrokerTransport>,
        kill_switch: Arc<KillSwitch>,
        broker: Arc<BrokerStateCache>,
        store: Arc<MarketStore>,
        tracker: Arc<EquityTracker>,
        supervisor: Arc<ConnectionSupervisor>,
        metrics: ExecutorMetrics,
        strategy_repo: Arc<StrategyRepository>,
        limits: SafetyLimits,
        correlation_lookback: usize,
    ) -> Self {
        Self {
            transport,
            kill_switch,
            broker,
            store,
            tracker,
            supervisor,
            metrics,
            strategy_repo,
            limits,
            correlation_lookback,
            monitor: OnceLock::new(),
            dispatcher: OnceLock::new(),
        }
    }

    pub fn set_monitor(&self, monitor: Arc<StrategyMonitor>) {
        let _ = self.monitor.set(monitor);
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    fn monitor(&self) -> Result<&Arc<StrategyMonitor>, ExecutorError> {
        self.monitor
            .get()
            .ok_or_else(|| ExecutorError::Internal("router wired without monitor".to_string()))
    }

    /// Pre-trade validation for an open request, run immediately before
    /// the broker call.
    fn validate_open(
        &self,
        cmd: &Command,
        symbol: &str,
        side: OrderSide,
        volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), ExecutorError> {
        let Some(account) = self.broker.account() else {
            return Err(ExecutorError::SafetyReject {
                rule: "account snapshot unavailable".to_string(),
            });
        };
        let positions = self.broker.positions();

        let candidate_price = self
            .store
            .latest_tick(symbol)
            .map(|t| t.mid())
            .unwrap_or(Decimal::ZERO);

        let candidate_returns =
            self.store
                .log_returns(symbol, CORRELATION_TIMEFRAME, self.correlation_lookback);
        let mut open_symbols: Vec<(String, Vec<f64>)> = Vec::new();
        for position in &positions {
            if position.symbol == symbol || open_symbols.iter().any(|(s, _)| s == &position.symbol)
            {
                continue;
            }
            if let Some(series) = self.store.log_returns(
                &position.symbol,
                CORRELATION_TIMEFRAME,
                self.correlation_lookback,
            ) {
                open_symbols.push((position.symbol.clone(), series));
            }
        }

        let signal = Signal {
            strategy_id: cmd.requester_id.clone(),
            symbol: symbol.to_string(),
            action: SignalAction::Open {
                side,
                volume,
                stop_loss,
                take_profit,
            },
            reason: format!("command {}", cmd.id),
            timestamp: cmd.created_at,
        };

        let peak = self.tracker.peak_equity();
        let ctx = ValidationContext {
            signal: &signal,
            account: &account,
            positions: &positions,
            limits: &self.limits,
            daily_pnl: self.tracker.daily_pnl(),
            peak_equity: if peak.is_zero() { account.equity } else { peak },
            candidate_price,
            correlation: CorrelationInputs {
                candidate: candidate_returns.as_deref(),
                open_symbols: &open_symbols,
            },
        };

        validate_signal(&ctx).map_err(|rule| {
            self.metrics
                .safety_rejections_total
                .with_label_values(&[rule.tag()])
                .inc();
            warn!("safety validator rejected {}: {rule}", cmd.id);
            ExecutorError::SafetyReject {
                rule: rule.to_string(),
            }
        })
    }

    fn status_snapshot(&self) -> serde_json::Value {
        let strategies = self
            .monitor
            .get()
            .map(|m| m.statuses())
            .unwrap_or_default();
        let queued = self
            .dispatcher
            .get()
            .map(|d| d.queued_len())
            .unwrap_or(0);
        serde_json::json!({
            "status": if self.kill_switch.is_active() { "halted" } else { "running" },
            "connections": self.supervisor.states(),
            "safety": {
                "active": self.kill_switch.is_active(),
                "reason": self.kill_switch.reason(),
            },
            "tradeReady": self.transport.is_trade_ready(),
            "strategies": strategies,
            "openPositionCount": self.broker.open_position_count(),
            "account": self.broker.account(),
            "queuedCommands": queued,
        })
    }

    fn record_broker_rpc<T>(&self, result: &Result<T, ExecutorError>) {
        match result {
            Ok(_) => self.supervisor.record_rpc(Link::Broker, true),
            Err(_) => {
                self.supervisor.record_rpc(Link::Broker, false);
                self.metrics.rpc_failures_total.inc();
            }
        }
    }
}

#[async_trait]
impl CommandRouter for ExecutorRouter {
    async fn execute(&self, cmd: &Command) -> Result<serde_json::Value, ExecutorError> {
        match &cmd.body {
            CommandBody::OpenPosition {
                symbol,
                side,
                volume,
                stop_loss,
                take_profit,
                magic,
            } => {
                self.validate_open(cmd, symbol, *side, *volume, *stop_loss, *take_profit)?;
                let result = self
                    .transport
                    .open_position(
                        symbol.clone(),
                        *side,
                        *volume,
                        *stop_loss,
                        *take_profit,
                        *magic,
                    )
                    .await;
                self.record_broker_rpc(&result);
                result
            }
            CommandBody::ClosePosition { ticket } => {
                let result = self.transport.close_position(*ticket).await;
                self.record_broker_rpc(&result);
                result
            }
            CommandBody::ModifyPosition {
                ticket,
                stop_loss,
                take_profit,
            } => {
                let result = self
                    .transport
                    .modify_position(*ticket, *stop_loss, *take_profit)
                    .await;
                self.record_broker_rpc(&result);
                result
            }
            CommandBody::CloseAll => {
                let result = self.transport.close_all().await;
                self.record_broker_rpc(&result);
                result
            }
            CommandBody::Pause => {
                self.monitor()?.pause_all();
                Ok(serde_json::json!({ "paused": true }))
            }
            CommandBody::Resume => {
                let released = self.kill_switch.release();
                self.monitor()?.resume_all();
                info!("resume command processed (kill switch released: {released})");
                Ok(serde_json::json!({ "resumed": true, "killSwitchReleased": released }))
            }
            CommandBody::GetStatus => Ok(self.status_snapshot()),
            CommandBody::EmergencyStop { reason } => {
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("emergency stop from {}", cmd.requester_id));
                self.kill_switch.engage(&reason);
                Ok(serde_json::json!({ "halted": true }))
            }
            CommandBody::StrategyReload(def) => {
                if def.status == StrategyStatus::Archived {
                    if let Err(e) = self.strategy_repo.remove(&def.id).await {
                        warn!("strategy cache remove failed: {e}");
                    }
                } else if let Err(e) = self.strategy_repo.upsert(def).await {
                    warn!("strategy cache write failed: {e}");
                }
                self.monitor()?.load(def.clone());
                Ok(serde_json::json!({
                    "strategyId": def.id,
                    "version": def.version,
                    "status": def.status,
                }))
            }
        }
    }
}
