mod definition;
mod indicator;
mod rules;

pub use definition::{
    Filter, Sizing, StrategyDefinition, StrategyStatus, TrailingStop,
};
pub use indicator::{BollingerBand, IndicatorSpec, MacdOutput, StochasticOutput};
pub use rules::{CompareOp, IndicatorSource, Operand, RuleNode};
