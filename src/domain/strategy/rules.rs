use super::indicator::IndicatorSpec;
use crate::domain::market::Timeframe;
use serde::{Deserialize, Serialize};

/// Comparison operators available at rule leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl CompareOp {
    fn apply(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Eq => left == right,
        }
    }
}

/// One side of a leaf comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operand {
    Indicator(IndicatorSpec),
    Price,
    Value(f64),
}

/// A boolean rule tree over indicator values and price.
///
/// Evaluation is short-circuit and tri-state: a leaf whose indicator has
/// insufficient history yields `None`, which propagates upward so the whole
/// expression evaluates to "no trade" rather than accidentally firing
/// through a negation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleNode {
    And(Vec<RuleNode>),
    Or(Vec<RuleNode>),
    Not(Box<RuleNode>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
}

/// Read-side of the market-data store as seen by rule evaluation.
pub trait IndicatorSource {
    /// `None` when there is insufficient history for the spec.
    fn indicator(&self, symbol: &str, timeframe: Timeframe, spec: &IndicatorSpec) -> Option<f64>;

    /// Latest mid price for the symbol; `None` before the first tick.
    fn price(&self, symbol: &str) -> Option<f64>;
}

impl RuleNode {
    /// Tri-state evaluation; `None` means "an operand was unavailable".
    pub fn evaluate(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        source: &dyn IndicatorSource,
    ) -> Option<bool> {
        match self {
            RuleNode::And(children) => {
                for child in children {
                    match child.evaluate(symbol, timeframe, source) {
                        Some(true) => continue,
                        other => return other,
                    }
                }
                Some(true)
            }
            RuleNode::Or(children) => {
                for child in children {
                    match child.evaluate(symbol, timeframe, source) {
                        Some(false) => continue,
                        other => return other,
                    }
                }
                Some(false)
            }
            RuleNode::Not(child) => child.evaluate(symbol, timeframe, source).map(|v| !v),
            RuleNode::Compare { left, op, right } => {
                let l = resolve(left, symbol, timeframe, source)?;
                let r = resolve(right, symbol, timeframe, source)?;
                Some(op.apply(l, r))
            }
        }
    }

    /// Strict evaluation: unavailable operands never produce a trade.
    pub fn is_satisfied(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        source: &dyn IndicatorSource,
    ) -> bool {
        self.evaluate(symbol, timeframe, source).unwrap_or(false)
    }

    /// Collect every indicator referenced anywhere in the tree.
    pub fn collect_indicators(&self, out: &mut Vec<IndicatorSpec>) {
        match self {
            RuleNode::And(children) | RuleNode::Or(children) => {
                for child in children {
                    child.collect_indicators(out);
                }
            }
            RuleNode::Not(child) => child.collect_indicators(out),
            RuleNode::Compare { left, right, .. } => {
                if let Operand::Indicator(spec) = left {
                    out.push(spec.clone());
                }
                if let Operand::Indicator(spec) = right {
                    out.push(spec.clone());
                }
            }
        }
    }

    /// Whether any leaf compares against live price. Such rules are
    /// re-evaluated on the tick path, not only at bar close.
    pub fn references_price(&self) -> bool {
        match self {
            RuleNode::And(children) | RuleNode::Or(children) => {
                children.iter().any(|c| c.references_price())
            }
            RuleNode::Not(child) => child.references_price(),
            RuleNode::Compare { left, right, .. } => {
                matches!(left, Operand::Price) || matches!(right, Operand::Price)
            }
        }
    }
}

fn resolve(
    operand: &Operand,
    symbol: &str,
    timeframe: Timeframe,
    source: &dyn IndicatorSource,
) -> Option<f64> {
    match operand {
        Operand::Indicator(spec) => source.indicator(symbol, timeframe, spec),
        Operand::Price => source.price(symbol),
        Operand::Value(v) => Some(*v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedSource {
        indicators: HashMap<IndicatorSpec, f64>,
        price: Option<f64>,
    }

    impl IndicatorSource for FixedSource {
        fn indicator(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            spec: &IndicatorSpec,
        ) -> Option<f64> {
            self.indicators.get(spec).copied()
        }

        fn price(&self, _symbol: &str) -> Option<f64> {
            self.price
        }
    }

    fn rsi14() -> IndicatorSpec {
        IndicatorSpec::Rsi { period: 14 }
    }

    fn ema20() -> IndicatorSpec {
        IndicatorSpec::Ema { period: 20 }
    }

    fn source(values: &[(IndicatorSpec, f64)], price: Option<f64>) -> FixedSource {
        FixedSource {
            indicators: values.iter().cloned().collect(),
            price,
        }
    }

    #[test]
    fn test_leaf_comparison() {
        let rule = RuleNode::Compare {
            left: Operand::Indicator(rsi14()),
            op: CompareOp::Lt,
            right: Operand::Value(30.0),
        };
        let src = source(&[(rsi14(), 25.0)], None);
        assert!(rule.is_satisfied("EURUSD", Timeframe::H1, &src));

        let src = source(&[(rsi14(), 55.0)], None);
        assert!(!rule.is_satisfied("EURUSD", Timeframe::H1, &src));
    }

    #[test]
    fn test_indicator_vs_indicator() {
        let rule = RuleNode::Compare {
            left: Operand::Indicator(ema20()),
            op: CompareOp::Gt,
            right: Operand::Indicator(rsi14()),
        };
        let src = source(&[(ema20(), 1.2), (rsi14(), 0.9)], None);
        assert!(rule.is_satisfied("EURUSD", Timeframe::H1, &src));
    }

    #[test]
    fn test_missing_indicator_never_trades() {
        // NOT(rsi < 30) with rsi unavailable must NOT evaluate to true.
        let rule = RuleNode::Not(Box::new(RuleNode::Compare {
            left: Operand::Indicator(rsi14()),
            op: CompareOp::Lt,
            right: Operand::Value(30.0),
        }));
        let src = source(&[], None);
        assert_eq!(rule.evaluate("EURUSD", Timeframe::H1, &src), None);
        assert!(!rule.is_satisfied("EURUSD", Timeframe::H1, &src));
    }

    #[test]
    fn test_and_short_circuit_on_false() {
        // Second child references a missing indicator, but the first child is
        // already false, so the expression is decided.
        let rule = RuleNode::And(vec![
            RuleNode::Compare {
                left: Operand::Value(1.0),
                op: CompareOp::Gt,
                right: Operand::Value(2.0),
            },
            RuleNode::Compare {
                left: Operand::Indicator(rsi14()),
                op: CompareOp::Lt,
                right: Operand::Value(30.0),
            },
        ]);
        let src = source(&[], None);
        assert_eq!(rule.evaluate("EURUSD", Timeframe::H1, &src), Some(false));
    }

    #[test]
    fn test_or_propagates_missing() {
        let rule = RuleNode::Or(vec![
            RuleNode::Compare {
                left: Operand::Indicator(rsi14()),
                op: CompareOp::Lt,
                right: Operand::Value(30.0),
            },
            RuleNode::Compare {
                left: Operand::Value(1.0),
                op: CompareOp::Lt,
                right: Operand::Value(2.0),
            },
        ]);
        let src = source(&[], None);
        assert_eq!(rule.evaluate("EURUSD", Timeframe::H1, &src), None);
    }

    #[test]
    fn test_price_leaf() {
        let rule = RuleNode::Compare {
            left: Operand::Price,
            op: CompareOp::Ge,
            right: Operand::Value(1.25),
        };
        let src = source(&[], Some(1.26));
        assert!(rule.is_satisfied("GBPUSD", Timeframe::M5, &src));
        assert!(rule.references_price());
    }

    #[test]
    fn test_collect_indicators() {
        let rule = RuleNode::And(vec![
            RuleNode::Compare {
                left: Operand::Indicator(rsi14()),
                op: CompareOp::Lt,
                right: Operand::Value(30.0),
            },
            RuleNode::Not(Box::new(RuleNode::Compare {
                left: Operand::Indicator(ema20()),
                op: CompareOp::Gt,
                right: Operand::Indicator(rsi14()),
            })),
        ]);
        let mut specs = Vec::new();
        rule.collect_indicators(&mut specs);
        assert_eq!(specs.len(), 3);
    }

    #[test]
    fn test_rule_serde_round_trip() {
        let rule = RuleNode::Or(vec![
            RuleNode::Compare {
                left: Operand::Indicator(rsi14()),
                op: CompareOp::Le,
                right: Operand::Value(30.0),
            },
            RuleNode::Compare {
                left: Operand::Price,
                op: CompareOp::Gt,
                right: Operand::Value(1.10),
            },
        ]);
        let json = serde_json::to_string(&rule).unwrap();
        let back: RuleNode = serde_json::from_str(&json).unwrap();
        assert_eq!(rule, back);
    }
}
