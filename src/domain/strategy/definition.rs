use super::indicator::IndicatorSpec;
use super::rules::RuleNode;
use crate::domain::market::Timeframe;
use crate::domain::trading::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// Position sizing method. Lot results are clamped by the monitor to the
/// configured broker min/max lot and rounded down to the lot step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Sizing {
    #[serde(rename_all = "camelCase")]
    FixedLots { lots: Decimal },
    /// Risk a fraction of balance over the stop distance in points.
    #[serde(rename_all = "camelCase")]
    RiskPercent { pct: Decimal, stop_points: Decimal },
    /// A fraction of balance divided by a notional-per-lot divisor.
    #[serde(rename_all = "camelCase")]
    BalanceFraction { pct: Decimal, divisor: Decimal },
}

/// Session/volatility/regime gates evaluated before the rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "camelCase")]
pub enum Filter {
    /// Only evaluate between these UTC hours (inclusive open, exclusive close).
    #[serde(rename_all = "camelCase")]
    Session { open_hour_utc: u8, close_hour_utc: u8 },
    /// Only evaluate on these ISO weekdays (1 = Monday .. 7 = Sunday).
    Weekday { days: Vec<u8> },
    /// Skip when the live spread exceeds this many points.
    #[serde(rename_all = "camelCase")]
    MaxSpread { points: Decimal },
    /// Skip when ATR is below a floor (dead market).
    #[serde(rename_all = "camelCase")]
    VolatilityFloor { atr_period: usize, min_atr: f64 },
}

/// Trailing-stop maintenance parameters; evaluated on the tick path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailingStop {
    pub atr_period: usize,
    pub atr_multiplier: f64,
}

/// Declarative trading logic downloaded from the control plane.
///
/// Hot-reload replaces the whole definition atomically between evaluations;
/// the running loop reads through an `Arc` swapped at the evaluation
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDefinition {
    pub id: String,
    pub version: u64,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    /// Direction the entry rule trades in
    #[serde(default = "default_side")]
    pub side: OrderSide,
    pub entry_rule: RuleNode,
    pub exit_rule: RuleNode,
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub sizing: Sizing,
    pub status: StrategyStatus,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Broker-side identifier grouping this strategy's tickets
    #[serde(default)]
    pub magic: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<TrailingStop>,
}

fn default_max_open_positions() -> usize {
    1
}

fn default_side() -> OrderSide {
    OrderSide::Buy
}

impl StrategyDefinition {
    /// Every indicator referenced by the rules, filters and trailing stop.
    pub fn required_indicators(&self) -> Vec<IndicatorSpec> {
        let mut specs = Vec::new();
        self.entry_rule.collect_indicators(&mut specs);
        self.exit_rule.collect_indicators(&mut specs);
        for filter in &self.filters {
            if let Filter::VolatilityFloor { atr_period, .. } = filter {
                specs.push(IndicatorSpec::Atr {
                    period: *atr_period,
                });
            }
        }
        if let Some(trailing) = &self.trailing_stop {
            specs.push(IndicatorSpec::Atr {
                period: trailing.atr_period,
            });
        }
        specs.sort_by_key(|s| format!("{s}"));
        specs.dedup();
        specs
    }

    /// Whether the tick path has anything to do for this strategy.
    pub fn wants_ticks(&self) -> bool {
        self.trailing_stop.is_some()
            || self.entry_rule.references_price()
            || self.exit_rule.references_price()
    }
}
