use crate::application::indicators;
use crate::application::market_data::MarketStore;
use crate::domain::strategy::{Filter, IndicatorSpec, Sizing, StrategyDefinition};
use crate::domain::trading::{OrderSide, Position, Signal, SignalAction};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use tracing::debug;

/// Broker lot constraints applied to every sizing result.
#[derive(Debug, Clone, Copy)]
pub struct LotBounds {
    pub min_lot: Decimal,
    pub max_lot: Decimal,
    pub lot_step: Decimal,
}

impl Default for LotBounds {
    fn default() -> Self {
        Self {
            min_lot: Decimal::new(1, 2),  // 0.01
            max_lot: Decimal::from(100),
            lot_step: Decimal::new(1, 2),
        }
    }
}

/// Everything one bar-close evaluation of one symbol looks at.
pub struct EvaluationInputs<'a> {
    pub def: &'a StrategyDefinition,
    pub symbol: &'a str,
    pub store: &'a MarketStore,
    /// This strategy's open positions across all of its symbols
    pub strategy_positions: &'a [Position],
    pub balance: Decimal,
    pub bounds: LotBounds,
    pub now_ms: i64,
}

/// One evaluation step at bar close:
/// indicators → filters → exit rule → entry rule → sizing.
///
/// Missing indicator values skip the symbol entirely. A symbol the
/// strategy already holds is only ever a candidate for exit, never for a
/// further entry; new entries are also capped by the strategy-wide open
/// position count.
pub fn evaluate_bar_close(inputs: &EvaluationInputs<'_>) -> Vec<Signal> {
    let def = inputs.def;
    let symbol = inputs.symbol;
    let tf = def.timeframe;

    for spec in def.required_indicators() {
        if inputs.store.value(symbol, tf, &spec).is_none() {
            debug!("monitor: {symbol} skipped, {spec} has insufficient history");
            return Vec::new();
        }
    }

    if !passes_filters(def, symbol, inputs.store, inputs.now_ms) {
        return Vec::new();
    }

    let symbol_positions: Vec<&Position> = inputs
        .strategy_positions
        .iter()
        .filter(|p| p.symbol == symbol)
        .collect();

    if !symbol_positions.is_empty() {
        if def.exit_rule.is_satisfied(symbol, tf, inputs.store) {
            return symbol_positions
                .iter()
                .map(|p| Signal {
                    strategy_id: def.id.clone(),
                    symbol: symbol.to_string(),
                    action: SignalAction::Close { ticket: p.ticket },
                    reason: "exit rule fired".to_string(),
                    timestamp: inputs.now_ms,
                })
                .collect();
        }
        return Vec::new();
    }

    if inputs.strategy_positions.len() >= def.max_open_positions {
        return Vec::new();
    }

    if def.entry_rule.is_satisfied(symbol, tf, inputs.store) {
        let volume = compute_lots(&def.sizing, inputs.balance, inputs.bounds);
        return vec![Signal {
            strategy_id: def.id.clone(),
            symbol: symbol.to_string(),
            action: SignalAction::Open {
                side: def.side,
                volume,
                stop_loss: None,
                take_profit: None,
            },
            reason: "entry rule fired".to_string(),
            timestamp: inputs.now_ms,
        }];
    }

    Vec::new()
}

/// Session/volatility gates. A filter that cannot be evaluated (no tick
/// yet, no ATR history) fails closed.
pub fn passes_filters(
    def: &StrategyDefinition,
    symbol: &str,
    store: &MarketStore,
    now_ms: i64,
) -> bool {
    let Some(now) = Utc.timestamp_millis_opt(now_ms).single() else {
        return false;
    };
    for filter in &def.filters {
        let pass = match filter {
            Filter::Session {
                open_hour_utc,
                close_hour_utc,
            } => {
                let hour = now.hour() as u8;
                if open_hour_utc <= close_hour_utc {
                    hour >= *open_hour_utc && hour < *close_hour_utc
                } else {
                    // Overnight session, e.g. 22 → 6
                    hour >= *open_hour_utc || hour < *close_hour_utc
                }
            }
            Filter::Weekday { days } => {
                days.contains(&(now.weekday().number_from_monday() as u8))
            }
            Filter::MaxSpread { points } => store
                .latest_tick(symbol)
                .map(|t| t.ask - t.bid <= *points)
                .unwrap_or(false),
            Filter::VolatilityFloor {
                atr_period,
                min_atr,
            } => store
                .value(
                    symbol,
                    def.timeframe,
                    &IndicatorSpec::Atr {
                        period: *atr_period,
                    },
                )
                .map(|atr| atr >= *min_atr)
                .unwrap_or(false),
        };
        if !pass {
            debug!("monitor: {symbol} gated by {filter:?}");
            return false;
        }
    }
    true
}

/// Position size per the strategy's sizing method, rounded down to the lot
/// step and clamped into the broker's bounds.
pub fn compute_lots(sizing: &Sizing, balance: Decimal, bounds: LotBounds) -> Decimal {
    let raw = match sizing {
        Sizing::FixedLots { lots } => *lots,
        Sizing::RiskPercent { pct, stop_points } => {
            if stop_points.is_zero() {
                bounds.min_lot
            } else {
                balance * *pct / Decimal::ONE_HUNDRED / *stop_points
            }
        }
        Sizing::BalanceFraction { pct, divisor } => {
            if divisor.is_zero() {
                bounds.min_lot
            } else {
                balance * *pct / Decimal::ONE_HUNDRED / *divisor
            }
        }
    };

    let stepped = if bounds.lot_step.is_zero() {
        raw
    } else {
        (raw / bounds.lot_step).floor() * bounds.lot_step
    };
    stepped.clamp(bounds.min_lot, bounds.max_lot)
}

/// Tick-path trailing-stop maintenance: ratchet each own position's stop
/// toward price by `atr × multiplier`, never loosening it.
pub fn trailing_signals(
    def: &StrategyDefinition,
    symbol: &str,
    store: &MarketStore,
    own_positions: &[Position],
    now_ms: i64,
) -> Vec<Signal> {
    let Some(trailing) = &def.trailing_stop else {
        return Vec::new();
    };
    let Some(atr) = store.value(
        symbol,
        def.timeframe,
        &IndicatorSpec::Atr {
            period: trailing.atr_period,
        },
    ) else {
        return Vec::new();
    };
    let Some(tick) = store.latest_tick(symbol) else {
        return Vec::new();
    };
    let Some(distance) = Decimal::from_f64(atr * trailing.atr_multiplier) else {
        return Vec::new();
    };
    if distance <= Decimal::ZERO {
        return Vec::new();
    }

    let mut signals = Vec::new();
    for position in own_positions {
        let candidate = match position.side {
            OrderSide::Buy => tick.bid - distance,
            OrderSide::Sell => tick.ask + distance,
        };
        let improves = match (position.side, position.stop_loss) {
            (OrderSide::Buy, Some(stop)) => candidate > stop,
            (OrderSide::Sell, Some(stop)) => candidate < stop,
            (_, None) => true,
        };
        if improves {
            signals.push(Signal {
                strategy_id: def.id.clone(),
                symbol: symbol.to_string(),
                action: SignalAction::Modify {
                    ticket: position.ticket,
                    stop_loss: Some(candidate),
                    take_profit: position.take_profit,
                },
                reason: "trailing stop ratchet".to_string(),
                timestamp: now_ms,
            });
        }
    }
    signals
}

/// Finalized-bar history needed before this strategy can evaluate.
pub fn warmup_bars(def: &StrategyDefinition) -> usize {
    def.required_indicators()
        .iter()
        .map(indicators::required_bars)
        .max()
        .unwrap_or(0)
}
