mod protocol;
mod rpc;
mod state;
mod stream;
mod transport;

pub use protocol::{BrokerErrorBody, OpenParams, RpcCall, RpcReply, RpcRequest, StreamFrame};
pub use rpc::RpcClient;
pub use state::BrokerStateCache;
pub use stream::StreamConsumer;
pub use transport::BrokerTransport;
