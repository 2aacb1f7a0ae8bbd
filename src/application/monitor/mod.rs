mod evaluation;
mod runtime;

pub use evaluation::{
    EvaluationInputs, LotBounds, compute_lots, evaluate_bar_close, passes_filters,
    trailing_signals, warmup_bars,
};
pub use runtime::{MonitorConfig, StrategyMonitor, StrategyRuntimeStatus};
