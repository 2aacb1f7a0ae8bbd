use rand::Rng;
use std::time::Duration;

/// Jitter applied on top of the exponential delay.
#[derive(Debug, Clone, Copy)]
pub enum Jitter {
    /// Delay scaled by `1 ± fraction`, e.g. 0.1 for ±10 %.
    Proportional(f64),
    /// Full jitter: `delay + U(0, base)`.
    Full,
}

/// Reusable jittered exponential backoff policy.
///
/// The same policy object drives both transport reconnects and
/// trade-command retries so the behavior stays consistent and tunable from
/// one place.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub jitter: Jitter,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Link reconnect schedule: 1 s base, ×2, ±10 % jitter, 60 s cap,
    /// 10 attempts before supervisor escalation.
    pub fn reconnect() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            jitter: Jitter::Proportional(0.1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    /// Trade-command retry schedule: `base · 2^(attempt-1) + U(0, base)`,
    /// capped at 30 s, 3 attempts.
    pub fn trade_retry() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            jitter: Jitter::Full,
            cap: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base.as_secs_f64() * exp;
        let mut rng = rand::rng();
        let jittered = match self.jitter {
            Jitter::Proportional(fraction) => {
                let scale = 1.0 + rng.random_range(-fraction..=fraction);
                raw * scale
            }
            Jitter::Full => raw + rng.random_range(0.0..self.base.as_secs_f64()),
        };
        Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64()))
    }
}

/// Stateful attempt counter over a policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful connection/operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
