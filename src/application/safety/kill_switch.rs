use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// State change notifications for subscribers (dispatcher, strategy
/// monitor, heartbeat).
#[derive(Debug, Clone)]
pub enum KillSwitchEvent {
    Engaged { reason: String },
    Released,
}

/// The process-wide trading halt flag.
///
/// A single atomic boolean guarded by lock-free reads on every
/// trade-admission path. Engaging is idempotent; the automatic `CloseAll`
/// that follows an engagement is claimed exactly once per engagement via
/// [`KillSwitch::claim_close_all`].
pub struct KillSwitch {
    active: AtomicBool,
    close_all_pending: AtomicBool,
    reason: Mutex<Option<String>>,
    event_tx: broadcast::Sender<KillSwitchEvent>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            active: AtomicBool::new(false),
            close_all_pending: AtomicBool::new(false),
            reason: Mutex::new(None),
            event_tx,
        }
    }

    /// Lock-free check used by all trade-admission paths.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Engage the switch. Returns `true` when this call flipped it; repeat
    /// engagements are no-ops so the automatic `CloseAll` fires once.
    pub fn engage(&self, reason: &str) -> bool {
        let newly = self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if newly {
            warn!("Kill switch ENGAGED: {reason}");
            *self
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
            self.close_all_pending.store(true, Ordering::SeqCst);
            let _ = self.event_tx.send(KillSwitchEvent::Engaged {
                reason: reason.to_string(),
            });
        }
        newly
    }

    /// Release requires an explicit authenticated `Resume`; idempotent.
    pub fn release(&self) -> bool {
        let newly = self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if newly {
            info!("Kill switch released");
            *self
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
            self.close_all_pending.store(false, Ordering::SeqCst);
            let _ = self.event_tx.send(KillSwitchEvent::Released);
        }
        newly
    }

    /// Claim the one automatic `CloseAll` for the current engagement.
    pub fn claim_close_all(&self) -> bool {
        self.close_all_pending
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KillSwitchEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engage_is_idempotent() {
        let ks = KillSwitch::new();
        assert!(!ks.is_active());

        assert!(ks.engage("daily loss breached"));
        assert!(ks.is_active());
        assert_eq!(ks.reason().as_deref(), Some("daily loss breached"));

        // Second engage is a no-op and must not re-arm CloseAll.
        assert!(ks.claim_close_all());
        assert!(!ks.engage("second reason"));
        assert!(!ks.claim_close_all());
    }

    #[test]
    fn test_close_all_claimed_exactly_once_per_engagement() {
        let ks = KillSwitch::new();
        ks.engage("breach");
        assert!(ks.claim_close_all());
        assert!(!ks.claim_close_all());

        ks.release();
        ks.engage("breach again");
        assert!(ks.claim_close_all());
        assert!(!ks.claim_close_all());
    }

    #[test]
    fn test_release_clears_reason() {
        let ks = KillSwitch::new();
        ks.engage("breach");
        assert!(ks.release());
        assert!(!ks.is_active());
        assert_eq!(ks.reason(), None);
        assert!(!ks.release());
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let ks = KillSwitch::new();
        let mut rx = ks.subscribe();

        ks.engage("transport failure");
        ks.release();

        match rx.recv().await.unwrap() {
            KillSwitchEvent::Engaged { reason } => assert_eq!(reason, "transport failure"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), KillSwitchEvent::Released));
    }
}
