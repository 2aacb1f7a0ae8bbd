//! In-process broker bridge simulator speaking the framed socket protocol.

use fx_executor::domain::trading::{AccountSnapshot, Position};
use fx_executor::infrastructure::bridge::{RpcCall, RpcReply, RpcRequest, StreamFrame};
use fx_executor::infrastructure::framing;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct BrokerSim {
    pub next_ticket: u64,
    pub positions: Vec<Position>,
    pub account: AccountSnapshot,
    /// When set, the next OPEN never replies (simulates a hung broker)
    pub stall_opens: bool,
    pub open_count: u32,
}

impl BrokerSim {
    fn new() -> Self {
        Self {
            next_ticket: 1000,
            positions: Vec::new(),
            account: AccountSnapshot {
                balance: dec!(10000),
                equity: dec!(10000),
                margin: Decimal::ZERO,
                free_margin: dec!(10000),
                margin_level: Decimal::ZERO,
                currency: "USD".to_string(),
            },
            stall_opens: false,
            open_count: 0,
        }
    }
}

pub struct MockBroker {
    pub rpc_addr: String,
    pub stream_addr: String,
    pub sim: Arc<Mutex<BrokerSim>>,
    stream_tx: broadcast::Sender<StreamFrame>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockBroker {
    pub async fn start() -> Self {
        let rpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_addr = rpc_listener.local_addr().unwrap().to_string();
        let stream_addr = stream_listener.local_addr().unwrap().to_string();

        let sim = Arc::new(Mutex::new(BrokerSim::new()));
        let (stream_tx, _) = broadcast::channel::<StreamFrame>(256);
        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        // RPC accept loop: reconnections get fresh connection tasks.
        {
            let sim = sim.clone();
            let stream_tx = stream_tx.clone();
            let conn_tasks = conn_tasks.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut sock, _)) = rpc_listener.accept().await else {
                        break;
                    };
                    let sim = sim.clone();
                    let stream_tx = stream_tx.clone();
                    let task = tokio::spawn(async move {
                        loop {
                            let request: RpcRequest =
                                match framing::read_frame(&mut sock).await {
                                    Ok(request) => request,
                                    Err(_) => break,
                                };
                            let (reply, frames, stall) = handle_rpc(&sim, request);
                            if stall {
                                tokio::time::sleep(Duration::from_secs(3600)).await;
                            }
                            for frame in frames {
                                let _ = stream_tx.send(frame);
                            }
                            if framing::write_frame(&mut sock, &reply).await.is_err() {
                                break;
                            }
                        }
                    });
                    conn_tasks.lock().unwrap().push(task);
                }
            });
        }

        // Stream accept loop: forward broadcast frames to the executor.
        {
            let stream_tx = stream_tx.clone();
            let conn_tasks = conn_tasks.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut sock, _)) = stream_listener.accept().await else {
                        break;
                    };
                    let mut rx = stream_tx.subscribe();
                    let task = tokio::spawn(async move {
                        loop {
                            match rx.recv().await {
                                Ok(frame) => {
                                    if framing::write_frame(&mut sock, &frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    });
                    conn_tasks.lock().unwrap().push(task);
                }
            });
        }

        Self {
            rpc_addr,
            stream_addr,
            sim,
            stream_tx,
            conn_tasks,
        }
    }

    /// Push a frame on the stream socket, as the terminal would.
    pub fn push_frame(&self, frame: StreamFrame) {
        let _ = self.stream_tx.send(frame);
    }

    /// Hard-drop every live connection (both sockets).
    pub fn kill_connections(&self) {
        let mut tasks = self.conn_tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn open_count(&self) -> u32 {
        self.sim.lock().unwrap().open_count
    }

    pub fn position_count(&self) -> usize {
        self.sim.lock().unwrap().positions.len()
    }
}

fn handle_rpc(
    sim: &Arc<Mutex<BrokerSim>>,
    request: RpcRequest,
) -> (RpcReply, Vec<StreamFrame>, bool) {
    let mut sim = sim.lock().unwrap();
    let req_id = request.req_id;
    let ok = |result: serde_json::Value| RpcReply {
        req_id,
        ok: true,
        result: Some(result),
        error: None,
    };

    match request.call {
        RpcCall::Account => (
            ok(serde_json::to_value(&sim.account).unwrap()),
            Vec::new(),
            false,
        ),
        RpcCall::Positions | RpcCall::Status => (
            ok(serde_json::to_value(&sim.positions).unwrap()),
            Vec::new(),
            false,
        ),
        RpcCall::Open(params) => {
            if sim.stall_opens {
                return (ok(serde_json::Value::Null), Vec::new(), true);
            }
            sim.open_count += 1;
            sim.next_ticket += 1;
            let ticket = sim.next_ticket;
            let position = Position {
                ticket,
                symbol: params.symbol.clone(),
                side: params.side,
                volume: params.volume,
                open_price: dec!(1.10),
                current_price: dec!(1.10),
                stop_loss: params.stop_loss,
                take_profit: params.take_profit,
                open_time: 0,
                unrealized_pnl: Decimal::ZERO,
                swap: Decimal::ZERO,
                commission: Decimal::ZERO,
                magic: params.magic,
            };
            sim.positions.push(position);
            let update = StreamFrame::PositionUpdate {
                positions: sim.positions.clone(),
            };
            (ok(serde_json::json!({ "ticket": ticket })), vec![update], false)
        }
        RpcCall::Close { ticket } => {
            let before = sim.positions.len();
            sim.positions.retain(|p| p.ticket != ticket);
            if sim.positions.len() == before {
                return (
                    RpcReply {
                        req_id,
                        ok: false,
                        result: None,
                        error: Some(fx_executor::infrastructure::bridge::BrokerErrorBody {
                            code: 4108,
                            message: format!("unknown ticket {ticket}"),
                        }),
                    },
                    Vec::new(),
                    false,
                );
            }
            let update = StreamFrame::PositionUpdate {
                positions: sim.positions.clone(),
            };
            (ok(serde_json::json!({ "closed": ticket })), vec![update], false)
        }
        RpcCall::Modify {
            ticket,
            stop_loss,
            take_profit,
        } => {
            for position in sim.positions.iter_mut() {
                if position.ticket == ticket {
                    position.stop_loss = stop_loss;
                    position.take_profit = take_profit;
                }
            }
            let update = StreamFrame::PositionUpdate {
                positions: sim.positions.clone(),
            };
            (ok(serde_json::json!({ "modified": ticket })), vec![update], false)
        }
        RpcCall::CloseAll => {
            let closed = sim.positions.len();
            sim.positions.clear();
            let update = StreamFrame::PositionUpdate {
                positions: Vec::new(),
            };
            (ok(serde_json::json!({ "closed": closed })), vec![update], false)
        }
    }
}

/// Poll until the predicate holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
