use super::client::ControlClient;
use crate::domain::command::CommandOutcome;
use crate::infrastructure::observability::ExecutorMetrics;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

const DEFAULT_CAPACITY: usize = 1024;
const RESEND_DELAY: Duration = Duration::from_secs(2);

/// Bounded outbound queue of command terminal reports.
///
/// Tolerates transient HTTP outages; overflow drops the oldest entry and
/// bumps a counter. The dispatcher's reporting is fire-and-forget from its
/// perspective; this queue owns persistence of delivery.
pub struct ReportOutbox {
    queue: Mutex<VecDeque<CommandOutcome>>,
    capacity: usize,
    notify: Notify,
    metrics: ExecutorMetrics,
}

impl ReportOutbox {
    pub fn new(metrics: ExecutorMetrics) -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY, metrics)
    }

    pub fn with_capacity(capacity: usize, metrics: ExecutorMetrics) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            metrics,
        })
    }

    /// Enqueue a report, dropping the oldest on overflow.
    pub fn push(&self, outcome: CommandOutcome) {
        {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if queue.len() == self.capacity {
                if let Some(dropped) = queue.pop_front() {
                    warn!(
                        "ReportOutbox: overflow, dropping oldest report {}",
                        dropped.id
                    );
                    self.metrics.reports_dropped_total.inc();
                }
            }
            queue.push_back(outcome);
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivery loop: sends the head, requeues it at the front on failure.
    pub async fn run(
        self: Arc<Self>,
        client: Arc<ControlClient>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("ReportOutbox: started");
        loop {
            let head = {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.pop_front()
            };

            match head {
                Some(outcome) => {
                    if let Err(e) = client.ack_command(&outcome).await {
                        warn!(
                            "ReportOutbox: ack for {} failed ({e}), will retry",
                            outcome.id
                        );
                        {
                            let mut queue = self
                                .queue
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            queue.push_front(outcome);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(RESEND_DELAY) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }

            if *shutdown.borrow() && self.is_empty() {
                break;
            }
            if *shutdown.borrow() {
                // Last chance drain: keep sending until empty or the grace
                // period elapses upstream of us.
                continue;
            }
        }
        info!("ReportOutbox: stopped");
    }
}
