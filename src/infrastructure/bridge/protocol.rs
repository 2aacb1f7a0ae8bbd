use crate::domain::market::{Bar, Tick, Timeframe};
use crate::domain::trading::{AccountSnapshot, FillNotice, OrderSide, Position};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Parameters of an `OPEN` request to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenParams {
    pub symbol: String,
    pub side: OrderSide,
    pub volume: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Strategy grouping identifier attached to the broker ticket
    #[serde(default)]
    pub magic: i64,
}

/// Request kinds on the RPC socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCall {
    Open(OpenParams),
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
    CloseAll,
    Status,
    Account,
    Positions,
}

/// One outbound request frame; `req_id` correlates the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "reqId")]
    pub req_id: u64,
    #[serde(flatten)]
    pub call: RpcCall,
}

/// Logical error body of a rejected request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerErrorBody {
    pub code: i32,
    pub message: String,
}

/// One inbound reply frame. Exactly one reply (or one local timeout) exists
/// per `req_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(rename = "reqId")]
    pub req_id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BrokerErrorBody>,
}

/// Typed frames on the unidirectional stream socket, broker → executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamFrame {
    Tick(Tick),
    PositionUpdate { positions: Vec<Position> },
    AccountSnapshot(AccountSnapshot),
    FillNotice(FillNotice),
    BarClose {
        symbol: String,
        timeframe: Timeframe,
        bar: Bar,
    },
}
