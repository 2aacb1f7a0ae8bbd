use crate::application::safety::KillSwitch;
use crate::infrastructure::backoff::{Backoff, BackoffPolicy};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// The three external links the supervisor watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    Push,
    Broker,
    Control,
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Link::Push => write!(f, "push"),
            Link::Broker => write!(f, "broker"),
            Link::Control => write!(f, "control"),
        }
    }
}

/// Per-link liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// Combined status reported in heartbeats and `GetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsStatus {
    pub push: LinkState,
    pub broker: LinkState,
    pub control: LinkState,
}

const DEGRADED_WINDOW: Duration = Duration::from_secs(30);
const DEGRADED_FAILURE_RATIO: f64 = 0.25;
const DEGRADED_LATENCY_FACTOR: f64 = 3.0;

#[derive(Debug)]
struct LinkHealth {
    state: LinkState,
    window_started: Instant,
    rpc_ok: u64,
    rpc_failed: u64,
    baseline_latency_ms: Option<f64>,
    last_latency_ms: Option<f64>,
}

impl LinkHealth {
    fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            window_started: Instant::now(),
            rpc_ok: 0,
            rpc_failed: 0,
            baseline_latency_ms: None,
            last_latency_ms: None,
        }
    }

    fn roll_window(&mut self) {
        if self.window_started.elapsed() > DEGRADED_WINDOW {
            self.window_started = Instant::now();
            self.rpc_ok = 0;
            self.rpc_failed = 0;
        }
    }

    fn is_degraded(&self) -> bool {
        let total = self.rpc_ok + self.rpc_failed;
        if total >= 4 {
            let ratio = self.rpc_failed as f64 / total as f64;
            if ratio > DEGRADED_FAILURE_RATIO {
                return true;
            }
        }
        if let (Some(baseline), Some(last)) = (self.baseline_latency_ms, self.last_latency_ms)
            && baseline > 0.0
            && last > baseline * DEGRADED_LATENCY_FACTOR
        {
            return true;
        }
        false
    }
}

/// Aggregates liveness of the three external links and sequences their
/// reconnection. Each link reconnects independently under the shared
/// backoff policy; exhausting the attempts escalates: the kill switch is
/// engaged, and a broker escalation is additionally fatal to the process.
pub struct ConnectionSupervisor {
    links: Mutex<HashMap<Link, LinkHealth>>,
    backoffs: Mutex<HashMap<Link, Backoff>>,
    kill_switch: Arc<KillSwitch>,
    fatal_tx: watch::Sender<Option<String>>,
}

impl ConnectionSupervisor {
    pub fn new(kill_switch: Arc<KillSwitch>) -> (Arc<Self>, watch::Receiver<Option<String>>) {
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let mut links = HashMap::new();
        let mut backoffs = HashMap::new();
        for link in [Link::Push, Link::Broker, Link::Control] {
            links.insert(link, LinkHealth::new());
            backoffs.insert(link, Backoff::new(BackoffPolicy::reconnect()));
        }
        (
            Arc::new(Self {
                links: Mutex::new(links),
                backoffs: Mutex::new(backoffs),
                kill_switch,
                fatal_tx,
            }),
            fatal_rx,
        )
    }

    /// Record a link state transition reported by the owning subsystem.
    pub fn report(&self, link: Link, state: LinkState) {
        let mut links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        let health = links.entry(link).or_insert_with(LinkHealth::new);
        if health.state != state {
            info!("Supervisor: link {link} is now {state:?}");
            health.state = state;
        }
        if state == LinkState::Connected {
            // A fresh connection starts a clean measurement window.
            health.window_started = Instant::now();
            health.rpc_ok = 0;
            health.rpc_failed = 0;
            self.backoffs
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .entry(link)
                .and_modify(|b| b.reset());
        }
    }

    /// Next reconnect delay for the link, or `None` once attempts are
    /// exhausted (the caller must then treat the link as escalated).
    pub fn reconnect_delay(&self, link: Link) -> Option<Duration> {
        let mut backoffs = self.backoffs.lock().unwrap_or_else(|p| p.into_inner());
        let backoff = backoffs
            .entry(link)
            .or_insert_with(|| Backoff::new(BackoffPolicy::reconnect()));
        let delay = backoff.next_delay();
        if let Some(d) = delay {
            warn!(
                "Supervisor: link {link} reconnect attempt {} in {:?}",
                backoff.attempt(),
                d
            );
        }
        delay
    }

    /// Engage the kill switch; a broker escalation is also fatal.
    pub fn escalate(&self, link: Link, reason: &str) {
        error!("Supervisor: link {link} escalated: {reason}");
        self.kill_switch
            .engage(&format!("supervisor escalation on {link} link: {reason}"));
        if link == Link::Broker {
            let _ = self.fatal_tx.send(Some(format!("broker link lost: {reason}")));
        }
    }

    /// Record the outcome of an RPC-ish operation on a link, feeding the
    /// degraded heuristic.
    pub fn record_rpc(&self, link: Link, ok: bool) {
        let mut links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        let health = links.entry(link).or_insert_with(LinkHealth::new);
        health.roll_window();
        if ok {
            health.rpc_ok += 1;
        } else {
            health.rpc_failed += 1;
        }
    }

    /// Feed a heartbeat round-trip latency sample (control link).
    pub fn record_latency(&self, link: Link, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        let mut links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        let health = links.entry(link).or_insert_with(LinkHealth::new);
        health.last_latency_ms = Some(ms);
        let baseline = health.baseline_latency_ms.get_or_insert(ms);
        if ms < *baseline {
            *baseline = ms;
        }
    }

    /// Re-evaluate the Connected ⇄ Degraded transitions. Run on a 5 s
    /// cadence by [`ConnectionSupervisor::run`].
    pub fn evaluate_degraded(&self) {
        let mut links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        for (link, health) in links.iter_mut() {
            health.roll_window();
            match health.state {
                LinkState::Connected if health.is_degraded() => {
                    warn!("Supervisor: link {link} degraded");
                    health.state = LinkState::Degraded;
                }
                LinkState::Degraded if !health.is_degraded() => {
                    info!("Supervisor: link {link} recovered from degraded");
                    health.state = LinkState::Connected;
                }
                _ => {}
            }
        }
    }

    pub fn states(&self) -> ConnectionsStatus {
        let links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        let get = |link: Link| {
            links
                .get(&link)
                .map(|h| h.state)
                .unwrap_or(LinkState::Disconnected)
        };
        ConnectionsStatus {
            push: get(Link::Push),
            broker: get(Link::Broker),
            control: get(Link::Control),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.evaluate_degraded(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
