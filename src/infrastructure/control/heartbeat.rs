use super::client::ControlClient;
use crate::application::monitor::StrategyMonitor;
use crate::application::safety::KillSwitch;
use crate::application::supervisor::{ConnectionSupervisor, ConnectionsStatus, Link, LinkState};
use crate::infrastructure::bridge::BrokerStateCache;
use crate::infrastructure::observability::ExecutorMetrics;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Holds the most recent `Internal` error until the next heartbeat ships
/// it upstream.
pub struct InternalErrorCapsule {
    inner: Mutex<Option<String>>,
}

impl InternalErrorCapsule {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(None),
        })
    }

    pub fn record(&self, message: String) {
        *self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message);
    }

    pub fn take(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub executor_id: String,
    pub status: String,
    pub connections: ConnectionsStatus,
    pub safety: SafetyStatus,
    pub active_strategy_count: usize,
    pub open_position_count: usize,
    pub metrics: HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_error: Option<String>,
}

/// Reports liveness every 5 s: executor status, per-link connection
/// states, safety state, counts and sampled metrics.
pub struct HeartbeatService {
    client: Arc<ControlClient>,
    supervisor: Arc<ConnectionSupervisor>,
    kill_switch: Arc<KillSwitch>,
    monitor: Arc<StrategyMonitor>,
    broker: Arc<BrokerStateCache>,
    metrics: ExecutorMetrics,
    capsule: Arc<InternalErrorCapsule>,
}

impl HeartbeatService {
    pub fn new(
        client: Arc<ControlClient>,
        supervisor: Arc<ConnectionSupervisor>,
        kill_switch: Arc<KillSwitch>,
        monitor: Arc<StrategyMonitor>,
        broker: Arc<BrokerStateCache>,
        metrics: ExecutorMetrics,
        capsule: Arc<InternalErrorCapsule>,
    ) -> Self {
        Self {
            client,
            supervisor,
            kill_switch,
            monitor,
            broker,
            metrics,
            capsule,
        }
    }

    pub fn assemble(&self) -> HeartbeatPayload {
        // Refresh the sampled gauges right before gathering.
        self.metrics
            .open_positions
            .set(self.broker.open_position_count() as f64);
        if let Some(account) = self.broker.account() {
            self.metrics
                .account_equity
                .set(account.equity.to_f64().unwrap_or(0.0));
        }
        self.metrics
            .kill_switch_active
            .set(if self.kill_switch.is_active() { 1.0 } else { 0.0 });

        let halted = self.kill_switch.is_active();
        HeartbeatPayload {
            executor_id: self.client.executor_id().to_string(),
            status: if halted { "halted" } else { "running" }.to_string(),
            connections: self.supervisor.states(),
            safety: SafetyStatus {
                active: halted,
                reason: self.kill_switch.reason(),
            },
            active_strategy_count: self.monitor.active_count(),
            open_position_count: self.broker.open_position_count(),
            metrics: self.metrics.sample(),
            internal_error: self.capsule.take(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("HeartbeatService: started ({:?} cadence)", HEARTBEAT_INTERVAL);
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let payload = self.assemble();
                    let body = match serde_json::to_value(&payload) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!("HeartbeatService: failed to encode payload: {e}");
                            continue;
                        }
                    };
                    let started = Instant::now();
                    match self.client.heartbeat(&body).await {
                        Ok(()) => {
                            self.supervisor.record_latency(Link::Control, started.elapsed());
                            self.supervisor.record_rpc(Link::Control, true);
                            self.supervisor.report(Link::Control, LinkState::Connected);
                            debug!("HeartbeatService: heartbeat delivered");
                        }
                        Err(e) => {
                            self.supervisor.record_rpc(Link::Control, false);
                            self.supervisor.report(Link::Control, LinkState::Disconnected);
                            warn!("HeartbeatService: heartbeat failed: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("HeartbeatService: stopped");
    }
}
