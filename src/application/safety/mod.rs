mod kill_switch;
mod limit_monitor;
mod validator;

pub use kill_switch::{KillSwitch, KillSwitchEvent};
pub use limit_monitor::{EquityTracker, LimitMonitor};
pub use validator::{CorrelationInputs, ValidationContext, validate_signal};
