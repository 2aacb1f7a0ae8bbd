use super::protocol::{OpenParams, RpcCall, RpcReply, RpcRequest, StreamFrame};
use super::rpc::{DEFAULT_RPC_TIMEOUT, MAX_IN_FLIGHT, RpcClient};
use super::state::BrokerStateCache;
use super::stream::StreamConsumer;
use crate::application::supervisor::{ConnectionSupervisor, Link, LinkState};
use crate::domain::errors::{ExecutorError, TransportError};
use crate::domain::trading::{AccountSnapshot, OrderSide, Position};
use crate::infrastructure::framing;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Owner of the local socket pair to the broker bridge: a request/reply
/// socket for order operations and a one-way stream socket for ticks,
/// position updates, account snapshots and fills.
///
/// On socket failure all outstanding RPC waiters fail with `Disconnected`
/// (retryable) and the transport reconnects under the supervisor's backoff.
/// After a reconnect it re-synchronizes positions and account before
/// accepting new trade mutations.
pub struct BrokerTransport {
    rpc: Arc<RpcClient>,
    cache: Arc<BrokerStateCache>,
    trade_gate: AtomicBool,
    rpc_addr: String,
    stream_addr: String,
}

impl BrokerTransport {
    pub fn new(rpc_addr: String, stream_addr: String, cache: Arc<BrokerStateCache>) -> Self {
        Self {
            rpc: Arc::new(RpcClient::new(DEFAULT_RPC_TIMEOUT)),
            cache,
            trade_gate: AtomicBool::new(false),
            rpc_addr,
            stream_addr,
        }
    }

    pub fn cache(&self) -> &Arc<BrokerStateCache> {
        &self.cache
    }

    /// Whether trade mutations are currently accepted (connected and
    /// post-reconnect sync completed).
    pub fn is_trade_ready(&self) -> bool {
        self.trade_gate.load(Ordering::SeqCst)
    }

    pub async fn open_position(
        &self,
        symbol: String,
        side: OrderSide,
        volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        magic: i64,
    ) -> Result<serde_json::Value, ExecutorError> {
        self.ensure_trade_ready()?;
        self.rpc
            .call(RpcCall::Open(OpenParams {
                symbol,
                side,
                volume,
                stop_loss,
                take_profit,
                magic,
            }))
            .await
    }

    pub async fn close_position(&self, ticket: u64) -> Result<serde_json::Value, ExecutorError> {
        self.ensure_trade_ready()?;
        self.rpc.call(RpcCall::Close { ticket }).await
    }

    pub async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<serde_json::Value, ExecutorError> {
        self.ensure_trade_ready()?;
        self.rpc
            .call(RpcCall::Modify {
                ticket,
                stop_loss,
                take_profit,
            })
            .await
    }

    pub async fn close_all(&self) -> Result<serde_json::Value, ExecutorError> {
        // CloseAll is the flatten-everything escape hatch; it only needs a
        // live socket, not a completed sync.
        self.rpc.call(RpcCall::CloseAll).await
    }

    pub async fn bridge_status(&self) -> Result<serde_json::Value, ExecutorError> {
        self.rpc.call(RpcCall::Status).await
    }

    fn ensure_trade_ready(&self) -> Result<(), ExecutorError> {
        if self.is_trade_ready() {
            Ok(())
        } else {
            // Retryable: the dispatcher backs off until the resync is done.
            Err(ExecutorError::Transport(TransportError::Disconnected))
        }
    }

    /// Fetch fresh account + positions through the RPC socket and install
    /// them in the local cache.
    pub async fn resync(&self) -> Result<(), ExecutorError> {
        let account_value = self.rpc.call(RpcCall::Account).await?;
        let account: AccountSnapshot = serde_json::from_value(account_value).map_err(|e| {
            ExecutorError::Transport(TransportError::Malformed(format!(
                "bad account snapshot: {e}"
            )))
        })?;
        self.cache.set_account(account);

        let positions_value = self.rpc.call(RpcCall::Positions).await?;
        let positions: Vec<Position> = serde_json::from_value(positions_value).map_err(|e| {
            ExecutorError::Transport(TransportError::Malformed(format!(
                "bad positions payload: {e}"
            )))
        })?;
        info!(
            "BrokerTransport: resynced {} open position(s)",
            positions.len()
        );
        self.cache.set_positions(positions);
        Ok(())
    }

    /// Connection supervision loop. Returns only on shutdown or after the
    /// supervisor escalates an exhausted reconnect schedule.
    pub async fn run(
        self: Arc<Self>,
        consumer: Arc<StreamConsumer>,
        supervisor: Arc<ConnectionSupervisor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            supervisor.report(Link::Broker, LinkState::Connecting);

            let sockets = tokio::try_join!(
                TcpStream::connect(&self.rpc_addr),
                TcpStream::connect(&self.stream_addr),
            );

            match sockets {
                Ok((rpc_sock, stream_sock)) => {
                    supervisor.report(Link::Broker, LinkState::Connected);
                    let reason = self
                        .serve_connection(rpc_sock, stream_sock, &consumer, &supervisor, &mut shutdown)
                        .await;
                    self.trade_gate.store(false, Ordering::SeqCst);
                    self.rpc.detach();
                    self.rpc.fail_all();
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!("BrokerTransport: connection lost: {reason}");
                }
                Err(e) => {
                    warn!("BrokerTransport: connect failed: {e}");
                }
            }

            supervisor.report(Link::Broker, LinkState::Disconnected);
            match supervisor.reconnect_delay(Link::Broker) {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                None => {
                    supervisor.escalate(Link::Broker, "reconnect attempts exhausted");
                    break;
                }
            }
        }
        info!("BrokerTransport: stopped");
    }

    async fn serve_connection(
        &self,
        rpc_sock: TcpStream,
        mut stream_sock: TcpStream,
        consumer: &StreamConsumer,
        supervisor: &ConnectionSupervisor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> TransportError {
        let (rpc_read, rpc_write) = rpc_sock.into_split();
        let (out_tx, out_rx) = mpsc::channel::<RpcRequest>(MAX_IN_FLIGHT);
        self.rpc.attach(out_tx);

        let writer = tokio::spawn(rpc_write_loop(rpc_write, out_rx));
        let mut reader = tokio::spawn(rpc_read_loop(rpc_read, self.rpc.clone()));

        // Re-synchronize before accepting new trade mutations.
        match self.resync().await {
            Ok(()) => {
                self.trade_gate.store(true, Ordering::SeqCst);
                supervisor.record_rpc(Link::Broker, true);
                info!("BrokerTransport: synchronized, trade mutations accepted");
            }
            Err(e) => {
                supervisor.record_rpc(Link::Broker, false);
                warn!("BrokerTransport: resync failed: {e}");
                writer.abort();
                reader.abort();
                return TransportError::Disconnected;
            }
        }

        // Single-consumer stream processing preserves frame order.
        let reason = loop {
            tokio::select! {
                frame = framing::read_frame::<_, StreamFrame>(&mut stream_sock) => {
                    match frame {
                        Ok(frame) => consumer.handle_frame(frame).await,
                        Err(TransportError::Malformed(msg)) => {
                            // Oversized/garbage frames are discarded with an
                            // error event; the stream itself is intact.
                            warn!("BrokerTransport: dropped stream frame: {msg}");
                            supervisor.record_rpc(Link::Broker, false);
                        }
                        Err(e) => break e,
                    }
                }
                res = &mut reader => {
                    break match res {
                        Ok(e) => e,
                        Err(_) => TransportError::Disconnected,
                    };
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break TransportError::Disconnected;
                    }
                }
            }
        };

        writer.abort();
        reader.abort();
        reason
    }
}

async fn rpc_read_loop(mut reader: OwnedReadHalf, rpc: Arc<RpcClient>) -> TransportError {
    loop {
        match framing::read_frame::<_, RpcReply>(&mut reader).await {
            Ok(reply) => rpc.handle_reply(reply),
            Err(TransportError::Malformed(msg)) => {
                warn!("BrokerTransport: dropped malformed RPC reply: {msg}");
            }
            Err(e) => return e,
        }
    }
}

async fn rpc_write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<RpcRequest>) {
    while let Some(request) = rx.recv().await {
        if let Err(e) = framing::write_frame(&mut writer, &request).await {
            warn!("BrokerTransport: RPC write failed: {e}");
            break;
        }
    }
}
