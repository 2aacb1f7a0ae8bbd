use super::protocol::{RpcCall, RpcReply, RpcRequest};
use crate::domain::errors::{ExecutorError, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

/// Default per-request deadline on the RPC socket.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum concurrent in-flight requests; overflow suspends the submitter.
pub const MAX_IN_FLIGHT: usize = 64;

/// Correlation layer over the bridge RPC socket.
///
/// Each outbound request carries a `req_id`; a table maps ids to pending
/// oneshot waiters. The table is mutated under a short critical section and
/// matched in O(1). The in-flight cap is a semaphore whose permits are held
/// for the full request lifetime, so the sum of outstanding waiters never
/// exceeds the cap.
pub struct RpcClient {
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcReply>>>,
    permits: Arc<Semaphore>,
    outbound: Mutex<Option<mpsc::Sender<RpcRequest>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            outbound: Mutex::new(None),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Attach the outbound channel of a freshly connected socket.
    pub fn attach(&self, tx: mpsc::Sender<RpcRequest>) {
        *self.outbound.lock().expect("outbound lock") = Some(tx);
    }

    /// Detach on disconnect; subsequent calls fail fast with `Disconnected`.
    pub fn detach(&self) {
        *self.outbound.lock().expect("outbound lock") = None;
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    /// Issue one request and await its correlated reply.
    pub async fn call(&self, call: RpcCall) -> Result<serde_json::Value, ExecutorError> {
        self.call_with_timeout(call, self.timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        call: RpcCall,
        timeout: Duration,
    ) -> Result<serde_json::Value, ExecutorError> {
        // Backpressure: waits here once MAX_IN_FLIGHT requests are pending.
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Internal("rpc semaphore closed".to_string()))?;

        let tx = self
            .outbound
            .lock()
            .expect("outbound lock")
            .clone()
            .ok_or(ExecutorError::Transport(TransportError::Disconnected))?;

        let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(req_id, reply_tx);

        let request = RpcRequest { req_id, call };
        if tx.send(request).await.is_err() {
            self.pending.lock().expect("pending lock").remove(&req_id);
            return Err(ExecutorError::Transport(TransportError::Disconnected));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                if reply.ok {
                    Ok(reply.result.unwrap_or(serde_json::Value::Null))
                } else {
                    let body = reply.error.unwrap_or_else(|| super::protocol::BrokerErrorBody {
                        code: -1,
                        message: "rejected without error body".to_string(),
                    });
                    Err(ExecutorError::BrokerReject {
                        code: body.code,
                        message: body.message,
                    })
                }
            }
            // Waiter dropped by fail_all on disconnect.
            Ok(Err(_)) => Err(ExecutorError::Transport(TransportError::Disconnected)),
            Err(_) => {
                // Reclaim the slot; a late reply finds no waiter and is dropped.
                self.pending.lock().expect("pending lock").remove(&req_id);
                Err(ExecutorError::Transport(TransportError::Timeout))
            }
        }
    }

    /// Route one inbound reply to its waiter. Unmatched replies (late after
    /// timeout, or stray) are logged and dropped.
    pub fn handle_reply(&self, reply: RpcReply) {
        let waiter = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(&reply.req_id);
        match waiter {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!("RpcClient: waiter gone before reply delivery");
                }
            }
            None => {
                warn!(
                    "RpcClient: dropping unmatched reply for reqId={}",
                    reply.req_id
                );
            }
        }
    }

    /// Fail every outstanding waiter with `Disconnected` (their oneshot
    /// senders are dropped). Called by the transport when a socket dies.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            warn!(
                "RpcClient: failing {} outstanding request(s) after disconnect",
                drained.len()
            );
        }
        // Dropping the senders wakes the waiters with RecvError.
    }
}
