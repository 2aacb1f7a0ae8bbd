use thiserror::Error;

/// Transport-level failures on any of the external links.
///
/// All variants are retryable at the transport layer with backoff; they are
/// never surfaced upstream as command outcomes without first passing through
/// the dispatcher's retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,

    #[error("transport operation timed out")]
    Timeout,

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// The exhaustive error taxonomy of the executor.
///
/// Every subsystem converts foreign errors into one of these kinds at its
/// boundary. User-visible failure is always one of these with a structured
/// reason.
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("broker rejected order: [{code}] {message}")]
    BrokerReject { code: i32, message: String },

    #[error("safety validator rejected: {rule}")]
    SafetyReject { rule: String },

    #[error("kill switch is active")]
    KillSwitchActive,

    #[error("queue full, retry later")]
    Backpressure,

    #[error("operation deadline exceeded")]
    Timeout,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Whether the dispatcher may retry a trade-mutating command that failed
    /// with this error. Semantic rejections (broker logical reject, safety
    /// veto, kill switch) never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::Transport(TransportError::Disconnected)
                | ExecutorError::Transport(TransportError::Timeout)
                | ExecutorError::Timeout
                | ExecutorError::Backpressure
        )
    }

    /// Short machine-readable tag used in command ACKs and the journal.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            ExecutorError::Config(_) => "config",
            ExecutorError::Auth(_) => "auth",
            ExecutorError::Transport(TransportError::Disconnected) => "disconnected",
            ExecutorError::Transport(TransportError::Timeout) => "transport_timeout",
            ExecutorError::Transport(TransportError::Malformed(_)) => "malformed",
            ExecutorError::BrokerReject { .. } => "broker_reject",
            ExecutorError::SafetyReject { .. } => "safety_reject",
            ExecutorError::KillSwitchActive => "kill_switch_active",
            ExecutorError::Backpressure => "backpressure",
            ExecutorError::Timeout => "timeout",
            ExecutorError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecutorError::Transport(TransportError::Disconnected).is_retryable());
        assert!(ExecutorError::Transport(TransportError::Timeout).is_retryable());
        assert!(ExecutorError::Timeout.is_retryable());

        assert!(
            !ExecutorError::BrokerReject {
                code: 134,
                message: "not enough money".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !ExecutorError::SafetyReject {
                rule: "max lot size".to_string(),
            }
            .is_retryable()
        );
        assert!(!ExecutorError::KillSwitchActive.is_retryable());
    }

    #[test]
    fn test_error_formatting() {
        let err = ExecutorError::BrokerReject {
            code: 134,
            message: "not enough money".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("134"));
        assert!(msg.contains("not enough money"));
    }
}
