pub mod backoff;
pub mod bridge;
pub mod control;
pub mod event_bus;
pub mod framing;
pub mod observability;
pub mod persistence;
pub mod push;
