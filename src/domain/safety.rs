use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account-wide risk limits, configured at startup and mutable only through
/// `EmergencyStop`/`Resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_daily_loss: Decimal,
    pub max_daily_loss_pct: Decimal,
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_open_positions: usize,
    pub max_lot_size: Decimal,
    /// Max absolute pairwise correlation of returns with any open position
    pub max_correlation: f64,
    pub max_total_exposure: Decimal,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: Decimal::from(1_000),
            max_daily_loss_pct: Decimal::from(5),
            max_drawdown: Decimal::from(2_000),
            max_drawdown_pct: Decimal::from(10),
            max_open_positions: 10,
            max_lot_size: Decimal::ONE,
            max_correlation: 0.8,
            max_total_exposure: Decimal::from(100_000),
        }
    }
}

/// Structured rejection reasons produced by the pre-trade validator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyRule {
    #[error("lot size {requested} exceeds limit {limit}")]
    LotSize { requested: Decimal, limit: Decimal },

    #[error("open position count {current} already at limit {limit}")]
    OpenPositions { current: usize, limit: usize },

    #[error("projected exposure {projected} exceeds limit {limit}")]
    TotalExposure { projected: Decimal, limit: Decimal },

    #[error("daily loss {loss} already beyond limit {limit}")]
    DailyLoss { loss: Decimal, limit: Decimal },

    #[error("drawdown {drawdown} from peak equity beyond limit {limit}")]
    Drawdown { drawdown: Decimal, limit: Decimal },

    #[error("correlation {correlation:.2} with {symbol} exceeds limit {limit:.2}")]
    Correlation {
        symbol: String,
        correlation: f64,
        limit: f64,
    },
}

impl SafetyRule {
    /// Short tag used in metrics and ACK payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            SafetyRule::LotSize { .. } => "lot_size",
            SafetyRule::OpenPositions { .. } => "open_positions",
            SafetyRule::TotalExposure { .. } => "total_exposure",
            SafetyRule::DailyLoss { .. } => "daily_loss",
            SafetyRule::Drawdown { .. } => "drawdown",
            SafetyRule::Correlation { .. } => "correlation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rule_formatting() {
        let rule = SafetyRule::LotSize {
            requested: dec!(2.5),
            limit: dec!(1.0),
        };
        let msg = rule.to_string();
        assert!(msg.contains("2.5"));
        assert!(msg.contains("1.0"));
        assert_eq!(rule.tag(), "lot_size");
    }

    #[test]
    fn test_limits_serde_defaults() {
        let limits: SafetyLimits = serde_json::from_str("{}").unwrap();
        assert_eq!(limits, SafetyLimits::default());
    }
}
