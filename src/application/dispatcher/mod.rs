mod dispatcher;
mod queue;
mod rate_limit;

pub use dispatcher::{CommandRouter, Dispatcher, DispatcherConfig};
pub use queue::{Admission, CommandQueues, QueuedCommand};
pub use rate_limit::{RateLimiters, TokenBucket};
