mod client;
mod heartbeat;
mod outbox;

pub use client::{ControlClient, ExecutorCredential, RegisterRequest};
pub use heartbeat::{HeartbeatPayload, HeartbeatService, InternalErrorCapsule, SafetyStatus};
pub use outbox::ReportOutbox;
