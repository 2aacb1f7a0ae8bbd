use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// A broker-owned position mirrored locally. The broker is the source of
/// truth; this cache is refreshed on every position-update stream event and
/// on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    pub open_time: i64,
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: Decimal,
    pub swap: Decimal,
    pub commission: Decimal,
    /// Broker-side identifier grouping tickets per strategy
    #[serde(default)]
    pub magic: i64,
}

impl Position {
    /// Notional exposure of this position at the current price
    pub fn exposure(&self) -> Decimal {
        self.volume * self.current_price
    }
}

/// Account state refreshed on a fixed interval and on every fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub margin_level: Decimal,
    #[serde(default)]
    pub currency: String,
}

/// Fill notification streamed from the broker bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillNotice {
    pub ticket: u64,
    pub price: Decimal,
    pub volume: Decimal,
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

/// What a signal wants done at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SignalAction {
    #[serde(rename_all = "camelCase")]
    Open {
        side: OrderSide,
        volume: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit: Option<Decimal>,
    },
    Close {
        ticket: u64,
    },
    #[serde(rename_all = "camelCase")]
    Modify {
        ticket: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit: Option<Decimal>,
    },
}

/// Coarse classification used by the safety validator: only position-opening
/// signals are subject to exposure/correlation checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalIntent {
    Open,
    Close,
    Modify,
}

/// A strategy-produced intent to act on a position, pre-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub strategy_id: String,
    pub symbol: String,
    #[serde(flatten)]
    pub action: SignalAction,
    pub reason: String,
    pub timestamp: i64,
}

impl Signal {
    pub fn intent(&self) -> SignalIntent {
        match self.action {
            SignalAction::Open { .. } => SignalIntent::Open,
            SignalAction::Close { .. } => SignalIntent::Close,
            SignalAction::Modify { .. } => SignalIntent::Modify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_display() {
        assert_eq!(OrderSide::Buy.to_string(), "BUY");
        assert_eq!(OrderSide::Sell.to_string(), "SELL");
    }

    #[test]
    fn test_position_exposure() {
        let pos = Position {
            ticket: 1001,
            symbol: "EURUSD".to_string(),
            side: OrderSide::Buy,
            volume: dec!(0.5),
            open_price: dec!(1.10),
            current_price: dec!(1.12),
            stop_loss: None,
            take_profit: None,
            open_time: 0,
            unrealized_pnl: dec!(10),
            swap: Decimal::ZERO,
            commission: Decimal::ZERO,
            magic: 0,
        };
        assert_eq!(pos.exposure(), dec!(0.56));
    }

    #[test]
    fn test_signal_serde_round_trip() {
        let signal = Signal {
            strategy_id: "s-1".to_string(),
            symbol: "EURUSD".to_string(),
            action: SignalAction::Open {
                side: OrderSide::Buy,
                volume: dec!(0.1),
                stop_loss: Some(dec!(1.09)),
                take_profit: None,
            },
            reason: "entry rule fired".to_string(),
            timestamp: 1704067200000,
        };
        let json = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(signal, back);
        assert_eq!(signal.intent(), SignalIntent::Open);
    }

    #[test]
    fn test_position_wire_shape() {
        let json = r#"{
            "ticket": 7,
            "symbol": "GBPUSD",
            "side": "SELL",
            "volume": "0.2",
            "openPrice": "1.27",
            "currentPrice": "1.26",
            "openTime": 1704067200000,
            "unrealizedPnL": "20.0",
            "swap": "0",
            "commission": "-1.4"
        }"#;
        let pos: Position = serde_json::from_str(json).unwrap();
        assert_eq!(pos.ticket, 7);
        assert_eq!(pos.side, OrderSide::Sell);
        assert_eq!(pos.stop_loss, None);
        assert_eq!(pos.magic, 0);
    }
}
