use super::kill_switch::KillSwitch;
use crate::domain::safety::SafetyLimits;
use crate::infrastructure::bridge::BrokerStateCache;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct TrackerState {
    /// UTC ordinal day the daily anchor belongs to
    day: i32,
    daily_start_equity: Decimal,
    peak_equity: Decimal,
    last_equity: Decimal,
}

/// Tracks the equity high-water mark and the UTC-daily anchor used for the
/// daily-loss and drawdown checks.
pub struct EquityTracker {
    inner: Mutex<Option<TrackerState>>,
}

impl EquityTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Fold in a fresh equity reading. The first reading seeds both the
    /// daily anchor and the peak; a UTC day rollover re-anchors the day.
    pub fn observe(&self, equity: Decimal, now: DateTime<Utc>) {
        let day = now.date_naive().num_days_from_ce();
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_mut() {
            None => {
                *guard = Some(TrackerState {
                    day,
                    daily_start_equity: equity,
                    peak_equity: equity,
                    last_equity: equity,
                });
            }
            Some(state) => {
                if state.day != day {
                    debug!("EquityTracker: new UTC day, re-anchoring daily equity");
                    state.day = day;
                    state.daily_start_equity = equity;
                }
                if equity > state.peak_equity {
                    state.peak_equity = equity;
                }
                state.last_equity = equity;
            }
        }
    }

    /// Realized + unrealized PnL since the daily anchor (equity delta).
    pub fn daily_pnl(&self) -> Decimal {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|s| s.last_equity - s.daily_start_equity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn peak_equity(&self) -> Decimal {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|s| s.peak_equity)
            .unwrap_or(Decimal::ZERO)
    }
}

impl Default for EquityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic breach monitor: watches the account cache and engages the kill
/// switch when a safety limit is already violated.
pub struct LimitMonitor {
    cache: Arc<BrokerStateCache>,
    tracker: Arc<EquityTracker>,
    limits: SafetyLimits,
    kill_switch: Arc<KillSwitch>,
    interval: Duration,
}

impl LimitMonitor {
    pub fn new(
        cache: Arc<BrokerStateCache>,
        tracker: Arc<EquityTracker>,
        limits: SafetyLimits,
        kill_switch: Arc<KillSwitch>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            tracker,
            limits,
            kill_switch,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "LimitMonitor started (interval: {:?})",
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_once(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One sweep; public for tests.
    pub fn check_once(&self) {
        let Some(account) = self.cache.account() else {
            return;
        };
        self.tracker.observe(account.equity, Utc::now());

        if self.kill_switch.is_active() {
            return;
        }
        if let Some(reason) = self.breach(&account.balance) {
            self.kill_switch.engage(&reason);
        }
    }

    fn breach(&self, balance: &Decimal) -> Option<String> {
        let daily_pnl = self.tracker.daily_pnl();
        let pct_limit = *balance * self.limits.max_daily_loss_pct / Decimal::ONE_HUNDRED;
        let daily_limit = self.limits.max_daily_loss.min(pct_limit);
        if daily_pnl < -daily_limit {
            return Some(format!(
                "daily loss {daily_pnl} breached limit {daily_limit}"
            ));
        }

        let peak = self.tracker.peak_equity();
        let drawdown = peak
            - self
                .cache
                .account()
                .map(|a| a.equity)
                .unwrap_or(peak);
        let pct_dd_limit = peak * self.limits.max_drawdown_pct / Decimal::ONE_HUNDRED;
        let dd_limit = self.limits.max_drawdown.min(pct_dd_limit);
        if drawdown > dd_limit {
            return Some(format!(
                "drawdown {drawdown} from peak equity breached limit {dd_limit}"
            ));
        }
        None
    }
}
