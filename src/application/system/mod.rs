mod router;

pub use router::ExecutorRouter;

use crate::application::dispatcher::{Dispatcher, DispatcherConfig};
use crate::application::monitor::{LotBounds, MonitorConfig, StrategyMonitor};
use crate::application::safety::{EquityTracker, KillSwitch, LimitMonitor};
use crate::application::supervisor::ConnectionSupervisor;
use crate::config::Config;
use crate::domain::command::CommandOutcome;
use crate::domain::errors::ExecutorError;
use crate::infrastructure::bridge::{BrokerStateCache, BrokerTransport, StreamConsumer};
use crate::infrastructure::control::{
    ControlClient, ExecutorCredential, HeartbeatService, InternalErrorCapsule, RegisterRequest,
    ReportOutbox,
};
use crate::application::market_data::MarketStore;
use crate::infrastructure::event_bus::MarketBus;
use crate::infrastructure::observability::ExecutorMetrics;
use crate::infrastructure::persistence::{
    CommandJournal, CredentialRepository, Database, SnapshotRepository, StoredSnapshot,
    StrategyRepository,
};
use crate::infrastructure::push::PushIngress;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// The wired agent: a constructor graph built once at startup, no global
/// mutable state beyond the kill switch flag.
pub struct Application {
    config: Config,
    kill_switch: Arc<KillSwitch>,
    metrics: ExecutorMetrics,
    capsule: Arc<InternalErrorCapsule>,
    broker_cache: Arc<BrokerStateCache>,
    tracker: Arc<EquityTracker>,
    supervisor: Arc<ConnectionSupervisor>,
    fatal_rx: watch::Receiver<Option<String>>,
    transport: Arc<BrokerTransport>,
    consumer: Arc<StreamConsumer>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<StrategyMonitor>,
    ingress: Arc<PushIngress>,
    control_client: Arc<ControlClient>,
    outbox: Arc<ReportOutbox>,
    journal: Arc<CommandJournal>,
    strategy_repo: Arc<StrategyRepository>,
    snapshot_repo: Arc<SnapshotRepository>,
    outcome_rx: mpsc::Receiver<CommandOutcome>,
    fill_rx: mpsc::Receiver<crate::domain::trading::FillNotice>,
}

impl Application {
    /// Build the constructor graph. Classified failures map to exit codes:
    /// `Config` → 1, `Auth` → 2.
    pub async fn build(config: Config) -> Result<Self, ExecutorError> {
        let metrics = ExecutorMetrics::new()
            .map_err(|e| ExecutorError::Internal(format!("metrics registry: {e}")))?;
        let kill_switch = Arc::new(KillSwitch::new());
        let capsule = InternalErrorCapsule::new();

        let db = Database::new(&config.db_url())
            .await
            .map_err(|e| ExecutorError::Config(format!("datastore: {e}")))?;
        let cred_repo = CredentialRepository::new(db.clone());
        let strategy_repo = Arc::new(StrategyRepository::new(db.clone()));
        let journal = Arc::new(CommandJournal::new(db.clone()));
        let snapshot_repo = Arc::new(SnapshotRepository::new(db.clone()));

        let credential = Self::resolve_credential(&config, &cred_repo).await?;
        let control_client = Arc::new(ControlClient::new(
            config.control.base_url.clone(),
            credential.clone(),
        ));

        let store = Arc::new(MarketStore::new(config.market.ring_capacity));
        let bus = Arc::new(MarketBus::new());
        let broker_cache = Arc::new(BrokerStateCache::new());
        let tracker = Arc::new(EquityTracker::new());
        let (supervisor, fatal_rx) = ConnectionSupervisor::new(kill_switch.clone());

        let transport = Arc::new(BrokerTransport::new(
            config.bridge.rpc_addr.clone(),
            config.bridge.stream_addr.clone(),
            broker_cache.clone(),
        ));
        let (fill_tx, fill_rx) = mpsc::channel(64);
        let consumer = Arc::new(StreamConsumer::new(
            store.clone(),
            bus.clone(),
            broker_cache.clone(),
            fill_tx,
        ));

        let router = Arc::new(ExecutorRouter::new(
            transport.clone(),
            kill_switch.clone(),
            broker_cache.clone(),
            store.clone(),
            tracker.clone(),
            supervisor.clone(),
            metrics.clone(),
            strategy_repo.clone(),
            config.safety.limits.clone(),
            config.safety.correlation_lookback_bars,
        ));

        let (outcome_tx, outcome_rx) = mpsc::channel(256);
        let known_ids = journal
            .known_ids()
            .await
            .map_err(|e| ExecutorError::Config(format!("journal: {e}")))?;
        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                queue_capacity: config.dispatcher.queue_capacity,
                rate_limit: config.dispatcher.rate_limit,
                rate_window: config.rate_window(),
                ..DispatcherConfig::default()
            },
            kill_switch.clone(),
            router.clone(),
            outcome_tx,
            metrics.clone(),
            known_ids,
        );
        router.set_dispatcher(dispatcher.clone());

        let monitor = StrategyMonitor::new(
            store.clone(),
            bus.clone(),
            broker_cache.clone(),
            kill_switch.clone(),
            dispatcher.clone(),
            MonitorConfig {
                bounds: LotBounds {
                    min_lot: config.monitor.min_lot,
                    max_lot: config.monitor.max_lot,
                    lot_step: config.monitor.lot_step,
                },
                evaluation_timeout: Duration::from_millis(config.monitor.evaluation_timeout_ms),
            },
        );
        router.set_monitor(monitor.clone());

        let ingress = PushIngress::new(
            config.control.push_url.clone(),
            credential.executor_id.clone(),
            credential.secret_key.clone(),
            dispatcher.clone(),
            kill_switch.clone(),
        );

        let outbox = ReportOutbox::new(metrics.clone());

        let app = Self {
            config,
            kill_switch,
            metrics,
            capsule,
            broker_cache,
            tracker,
            supervisor,
            fatal_rx,
            transport,
            consumer,
            dispatcher,
            monitor,
            ingress,
            control_client,
            outbox,
            journal,
            strategy_repo,
            snapshot_repo,
            outcome_rx,
            fill_rx,
        };
        app.restore_cold_state().await;
        Ok(app)
    }

    async fn resolve_credential(
        config: &Config,
        repo: &CredentialRepository,
    ) -> Result<ExecutorCredential, ExecutorError> {
        if let (Some(executor_id), Some(api_key), Some(secret_key)) = (
            config.control.executor_id.clone(),
            config.control.api_key.clone(),
            config.control.secret_key.clone(),
        ) {
            let credential = ExecutorCredential {
                executor_id,
                api_key,
                secret_key,
            };
            repo.save(&credential)
                .await
                .map_err(|e| ExecutorError::Config(format!("credential store: {e}")))?;
            return Ok(credential);
        }

        if let Some(credential) = repo
            .load()
            .await
            .map_err(|e| ExecutorError::Config(format!("credential store: {e}")))?
        {
            return Ok(credential);
        }

        info!("no stored credential; registering with the control plane");
        let credential = ControlClient::register(
            &config.control.base_url,
            &RegisterRequest {
                name: config.executor.name.clone(),
                platform: config.executor.platform.clone(),
                broker_server: config.executor.broker_server.clone(),
                account_number: config.executor.account_number.clone(),
            },
        )
        .await?;
        repo.save(&credential)
            .await
            .map_err(|e| ExecutorError::Config(format!("credential store: {e}")))?;
        Ok(credential)
    }

    /// Cold-start restore: recovery snapshot (kill-switch flag), cached
    /// strategy set, then a best-effort control-plane sync.
    async fn restore_cold_state(&self) {
        match self.snapshot_repo.load_latest().await {
            Ok(Some(snapshot)) if snapshot.kill_switch_active => {
                self.kill_switch
                    .engage("restored from recovery snapshot (was halted at last run)");
            }
            Ok(_) => {}
            Err(e) => warn!("snapshot restore failed: {e}"),
        }

        match self.strategy_repo.load_all().await {
            Ok(cached) => {
                if !cached.is_empty() {
                    info!("loading {} cached strategy definition(s)", cached.len());
                }
                for def in cached {
                    self.monitor.load(def);
                }
            }
            Err(e) => warn!("strategy cache load failed: {e}"),
        }

        match self.control_client.download_strategies().await {
            Ok(defs) => {
                info!("synchronized {} strategy definition(s) from control plane", defs.len());
                for def in defs {
                    if let Err(e) = self.strategy_repo.upsert(&def).await {
                        warn!("strategy cache write failed: {e}");
                    }
                    self.monitor.load(def);
                }
            }
            Err(e) => warn!("initial strategy sync failed, using cached set: {e}"),
        }
    }

    /// Spawn every long-lived task, wait for a shutdown trigger, then run
    /// the ordered teardown. Returns the process exit code.
    pub async fn run(self) -> i32 {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.supervisor.clone().run(shutdown_rx.clone()),
        ));
        handles.push(tokio::spawn(self.transport.clone().run(
            self.consumer.clone(),
            self.supervisor.clone(),
            shutdown_rx.clone(),
        )));
        let dispatcher_handle = tokio::spawn(self.dispatcher.clone().run(shutdown_rx.clone()));
        handles.push(tokio::spawn(self.ingress.clone().run(
            self.supervisor.clone(),
            shutdown_rx.clone(),
        )));

        let limit_monitor = LimitMonitor::new(
            self.broker_cache.clone(),
            self.tracker.clone(),
            self.config.safety.limits.clone(),
            self.kill_switch.clone(),
            Duration::from_secs(self.config.safety.limit_check_interval_secs),
        );
        handles.push(tokio::spawn(limit_monitor.run(shutdown_rx.clone())));

        let heartbeat = HeartbeatService::new(
            self.control_client.clone(),
            self.supervisor.clone(),
            self.kill_switch.clone(),
            self.monitor.clone(),
            self.broker_cache.clone(),
            self.metrics.clone(),
            self.capsule.clone(),
        );
        handles.push(tokio::spawn(heartbeat.run(shutdown_rx.clone())));

        handles.push(tokio::spawn(self.outbox.clone().run(
            self.control_client.clone(),
            shutdown_rx.clone(),
        )));

        // Terminal outcomes: journal first, then upstream report.
        {
            let journal = self.journal.clone();
            let outbox = self.outbox.clone();
            let mut outcome_rx = self.outcome_rx;
            handles.push(tokio::spawn(async move {
                while let Some(outcome) = outcome_rx.recv().await {
                    if let Err(e) = journal.record(&outcome).await {
                        warn!("journal write failed for {}: {e}", outcome.id);
                    }
                    outbox.push(outcome);
                }
            }));
        }

        // Position sync: on every fill and on a fixed interval.
        {
            let client = self.control_client.clone();
            let cache = self.broker_cache.clone();
            let mut fill_rx = self.fill_rx;
            let mut shutdown = shutdown_rx.clone();
            let interval = Duration::from_secs(self.config.sync.position_sync_interval_secs);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        maybe_fill = fill_rx.recv() => {
                            if maybe_fill.is_none() {
                                break;
                            }
                            sync_positions(&client, &cache).await;
                        }
                        _ = ticker.tick() => sync_positions(&client, &cache).await,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Recovery snapshots: periodic and on kill-switch transitions.
        {
            let snapshot_repo = self.snapshot_repo.clone();
            let strategy_repo = self.strategy_repo.clone();
            let dispatcher = self.dispatcher.clone();
            let kill_switch = self.kill_switch.clone();
            let mut kill_events = self.kill_switch.subscribe();
            let mut shutdown = shutdown_rx.clone();
            let interval = Duration::from_secs(self.config.sync.snapshot_interval_secs);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        event = kill_events.recv() => {
                            if event.is_err() {
                                continue;
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    let snapshot = StoredSnapshot {
                        taken_at: Utc::now().timestamp_millis(),
                        kill_switch_active: kill_switch.is_active(),
                        open_command_ids: dispatcher.open_command_ids(),
                        strategy_set_version: strategy_repo.max_version().await.unwrap_or(0),
                    };
                    if let Err(e) = snapshot_repo.save(&snapshot).await {
                        warn!("snapshot write failed: {e}");
                    }
                }
            }));
        }

        info!("executor running (executor id: {})", self.control_client.executor_id());

        // Wait for Ctrl-C or a fatal supervisor escalation.
        let mut fatal_rx = self.fatal_rx.clone();
        let exit_code = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                0
            }
            _ = fatal_rx.changed() => {
                match fatal_rx.borrow().clone() {
                    Some(reason) => {
                        error!("fatal supervisor escalation: {reason}");
                        3
                    }
                    None => 0,
                }
            }
        };

        // Ordered teardown: monitor stops emitting signals, the dispatcher
        // drains, the broker transport gets a 5 s flush grace.
        self.monitor.shutdown();
        let _ = shutdown_tx.send(true);

        if tokio::time::timeout(Duration::from_secs(5), dispatcher_handle)
            .await
            .is_err()
        {
            warn!("dispatcher did not drain within grace period");
        }
        for handle in handles {
            handle.abort();
        }
        info!("executor stopped");
        exit_code
    }
}

async fn sync_positions(client: &ControlClient, cache: &BrokerStateCache) {
    let positions = cache.positions();
    let account = cache.account();
    if let Err(e) = client.sync_positions(&positions, account.as_ref()).await {
        warn!("position sync failed: {e}");
    }
}
