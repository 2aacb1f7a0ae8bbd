use crate::domain::strategy::StrategyDefinition;
use crate::domain::trading::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Command priority, highest last. Commands of the same priority execute in
/// FIFO order; across priorities dispatch is strict preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const COUNT: usize = 4;

    /// Index into the dispatcher's sub-queue array, 0 = Urgent.
    pub fn queue_index(&self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// Rate-limit family. Each family has its own token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindFamily {
    TradeMutating,
    Read,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    OpenPosition,
    ClosePosition,
    ModifyPosition,
    CloseAll,
    Pause,
    Resume,
    GetStatus,
    EmergencyStop,
    StrategyReload,
}

impl CommandKind {
    pub fn family(&self) -> KindFamily {
        match self {
            CommandKind::OpenPosition
            | CommandKind::ClosePosition
            | CommandKind::ModifyPosition
            | CommandKind::CloseAll => KindFamily::TradeMutating,
            CommandKind::GetStatus => KindFamily::Read,
            CommandKind::Pause
            | CommandKind::Resume
            | CommandKind::EmergencyStop
            | CommandKind::StrategyReload => KindFamily::Control,
        }
    }

    /// Kinds still admitted from outside while the kill switch is active.
    /// The automatic `CloseAll` that follows an engagement enters through
    /// the dispatcher's internal path instead.
    pub fn admitted_during_halt(&self) -> bool {
        matches!(
            self,
            CommandKind::EmergencyStop
                | CommandKind::Resume
                | CommandKind::GetStatus
                | CommandKind::StrategyReload
        )
    }

    /// Kinds that skip rate limiting and preempt at dispatch.
    pub fn bypasses_rate_limit(&self) -> bool {
        matches!(self, CommandKind::EmergencyStop | CommandKind::CloseAll)
    }

    /// Per-kind execution deadline.
    pub fn execution_timeout(&self) -> Duration {
        match self.family() {
            KindFamily::TradeMutating => Duration::from_secs(10),
            KindFamily::Read => Duration::from_secs(5),
            KindFamily::Control => Duration::from_secs(2),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Kind-specific request content. Adjacently tagged so the wire shape is
/// `{"kind": "...", "payload": {...}}` as the control plane sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum CommandBody {
    #[serde(rename_all = "camelCase")]
    OpenPosition {
        symbol: String,
        side: OrderSide,
        volume: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit: Option<Decimal>,
        /// Strategy grouping id for locally originated opens; 0 for
        /// control-plane commands
        #[serde(default)]
        magic: i64,
    },
    ClosePosition {
        ticket: u64,
    },
    #[serde(rename_all = "camelCase")]
    ModifyPosition {
        ticket: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit: Option<Decimal>,
    },
    CloseAll,
    Pause,
    Resume,
    GetStatus,
    EmergencyStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StrategyReload(StrategyDefinition),
}

impl CommandBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandBody::OpenPosition { .. } => CommandKind::OpenPosition,
            CommandBody::ClosePosition { .. } => CommandKind::ClosePosition,
            CommandBody::ModifyPosition { .. } => CommandKind::ModifyPosition,
            CommandBody::CloseAll => CommandKind::CloseAll,
            CommandBody::Pause => CommandKind::Pause,
            CommandBody::Resume => CommandKind::Resume,
            CommandBody::GetStatus => CommandKind::GetStatus,
            CommandBody::EmergencyStop { .. } => CommandKind::EmergencyStop,
            CommandBody::StrategyReload(_) => CommandKind::StrategyReload,
        }
    }
}

/// Unit of work consumed from the push channel or submitted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Unique id; the deduplication key across the process lifetime.
    pub id: String,
    #[serde(flatten)]
    pub body: CommandBody,
    pub priority: Priority,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub requester_id: String,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|t| t <= now_ms)
    }
}

/// Lifecycle state of a command. Terminal states are ACKed upstream exactly
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Received,
    Queued,
    Deferred,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Completed
                | CommandState::Failed
                | CommandState::Cancelled
                | CommandState::Expired
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandState::Received => "received",
            CommandState::Queued => "queued",
            CommandState::Deferred => "deferred",
            CommandState::Executing => "executing",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Cancelled => "cancelled",
            CommandState::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Terminal outcome handed to the control client for upstream reporting and
/// recorded in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub id: String,
    pub kind: CommandKind,
    pub state: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: i64,
}

/// Rejection reasons for `Submit`; returned without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitRejection {
    Duplicate,
    Expired,
    Malformed(String),
    KillSwitchActive,
    Backpressure,
}

impl fmt::Display for SubmitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitRejection::Duplicate => write!(f, "duplicate command id"),
            SubmitRejection::Expired => write!(f, "command already expired"),
            SubmitRejection::Malformed(reason) => write!(f, "malformed command: {reason}"),
            SubmitRejection::KillSwitchActive => write!(f, "kill switch is active"),
            SubmitRejection::Backpressure => write!(f, "command queue full"),
        }
    }
}

/// Result of `Cancel(id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    Cancelled,
    TooLate,
    Unknown,
}
