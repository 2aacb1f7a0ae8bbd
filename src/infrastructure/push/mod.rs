use crate::application::dispatcher::Dispatcher;
use crate::application::safety::KillSwitch;
use crate::application::supervisor::{ConnectionSupervisor, Link, LinkState};
use crate::domain::command::{Command, CommandBody, Priority, SubmitRejection};
use crate::domain::strategy::StrategyDefinition;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded recent-id set for at-least-once dedup (last 4 096 ids).
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` when the id is new; remembers it either way.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Events arriving on the private `executor.<id>` topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum PushEvent {
    #[serde(rename = "command")]
    Command(Command),
    #[serde(rename = "kill")]
    Kill { reason: String },
    #[serde(rename = "strategy.update")]
    #[serde(rename_all = "camelCase")]
    StrategyUpdate {
        strategy_id: String,
        version: u64,
        definition: StrategyDefinition,
    },
    #[serde(rename = "resume")]
    Resume,
}

/// Subscribes to the control plane's push channel, authenticates with the
/// executor credential and translates inbound events into commands.
///
/// Out-of-band `kill` events bypass the queue entirely. Delivery is
/// at-least-once upstream; duplicates are dropped here against a bounded
/// recent-id set before they reach the dispatcher.
pub struct PushIngress {
    url: String,
    executor_id: String,
    secret_key: String,
    dispatcher: Arc<Dispatcher>,
    kill_switch: Arc<KillSwitch>,
    recent: Mutex<RecentIds>,
}

impl PushIngress {
    pub fn new(
        url: String,
        executor_id: String,
        secret_key: String,
        dispatcher: Arc<Dispatcher>,
        kill_switch: Arc<KillSwitch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url,
            executor_id,
            secret_key,
            dispatcher,
            kill_switch,
            recent: Mutex::new(RecentIds::new(4096)),
        })
    }

    pub async fn run(
        self: Arc<Self>,
        supervisor: Arc<ConnectionSupervisor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            supervisor.report(Link::Push, LinkState::Connecting);

            match self.connect_and_consume(&supervisor, &mut shutdown).await {
                Ok(()) => {
                    info!("PushIngress: connection closed by server");
                }
                Err(e) => {
                    warn!("PushIngress: connection error: {e}");
                }
            }
            supervisor.report(Link::Push, LinkState::Disconnected);
            if *shutdown.borrow() {
                break;
            }

            // Blocks until the supervisor clears the next attempt. The push
            // link is not fatal on its own: after an escalation the
            // schedule restarts at its base delay.
            let delay = match supervisor.reconnect_delay(Link::Push) {
                Some(delay) => delay,
                None => {
                    supervisor.escalate(Link::Push, "reconnect attempts exhausted");
                    supervisor.report(Link::Push, LinkState::Connected); // reset backoff
                    supervisor.report(Link::Push, LinkState::Disconnected);
                    Duration::from_secs(60)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("PushIngress: stopped");
    }

    async fn connect_and_consume(
        &self,
        supervisor: &ConnectionSupervisor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(&self.url)).await??;
        let (mut write, mut read) = ws_stream.split();

        // Authenticate, then subscribe to the private topic.
        let timestamp = Utc::now().timestamp_millis();
        let auth = serde_json::json!({
            "op": "auth",
            "executorId": self.executor_id,
            "timestamp": timestamp,
            "signature": self.sign(&timestamp.to_string()),
        });
        write.send(Message::Text(auth.to_string().into())).await?;

        let subscribe = serde_json::json!({
            "op": "subscribe",
            "topic": format!("executor.{}", self.executor_id),
        });
        write
            .send(Message::Text(subscribe.to_string().into()))
            .await?;

        info!(
            "PushIngress: subscribed to executor.{}",
            self.executor_id
        );
        supervisor.report(Link::Push, LinkState::Connected);

        // Outgoing messages (pongs, pings) go through a channel so the
        // read loop stays the only consumer of the stream.
        let (ws_tx, mut ws_rx) = tokio::sync::mpsc::channel::<Message>(16);
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let tx_ping = ws_tx.clone();
        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(PING_INTERVAL);
            ping_interval.tick().await; // skip the immediate first tick
            loop {
                ping_interval.tick().await;
                if tx_ping.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws_tx.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn sign(&self, payload: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn handle_text(&self, text: &str) {
        let event: PushEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("PushIngress: dropping malformed event: {e}");
                return;
            }
        };
        self.handle_event(event);
    }

    fn handle_event(&self, event: PushEvent) {
        match event {
            PushEvent::Command(cmd) => {
                if !self
                    .recent
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(&cmd.id)
                {
                    debug!("PushIngress: duplicate command {} dropped", cmd.id);
                    return;
                }
                let id = cmd.id.clone();
                match self.dispatcher.submit(cmd) {
                    Ok(()) => debug!("PushIngress: command {id} enqueued"),
                    Err(SubmitRejection::Duplicate) => {
                        debug!("PushIngress: command {id} already known, dropped");
                    }
                    Err(e) => warn!("PushIngress: command {id} rejected: {e}"),
                }
            }
            PushEvent::Kill { reason } => {
                // Out-of-band: bypasses the queue entirely.
                self.kill_switch.engage(&format!("remote kill: {reason}"));
            }
            PushEvent::Resume => {
                let cmd = Command {
                    id: format!("resume-{}", Uuid::new_v4()),
                    body: CommandBody::Resume,
                    priority: Priority::Urgent,
                    created_at: Utc::now().timestamp_millis(),
                    expires_at: None,
                    requester_id: "control-plane".to_string(),
                };
                if let Err(e) = self.dispatcher.submit(cmd) {
                    warn!("PushIngress: resume rejected: {e}");
                }
            }
            PushEvent::StrategyUpdate {
                strategy_id,
                version,
                definition,
            } => {
                let cmd = Command {
                    id: format!("strategy-{strategy_id}-v{version}"),
                    body: CommandBody::StrategyReload(definition),
                    priority: Priority::Normal,
                    created_at: Utc::now().timestamp_millis(),
                    expires_at: None,
                    requester_id: "control-plane".to_string(),
                };
                match self.dispatcher.submit(cmd) {
                    Ok(()) => info!("PushIngress: strategy {strategy_id} v{version} reload queued"),
                    Err(SubmitRejection::Duplicate) => {
                        debug!("PushIngress: strategy {strategy_id} v{version} already queued");
                    }
                    Err(e) => warn!("PushIngress: strategy reload rejected: {e}"),
                }
            }
        }
    }
}
