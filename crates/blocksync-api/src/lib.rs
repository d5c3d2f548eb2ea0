// blocksync-api: wire-level clients for a block node (JSON-RPC, envelope stream, feeds)

pub mod error;
pub mod feed;
pub mod rpc;
pub mod stream;
pub mod transport;

pub use error::Error;
pub use feed::{Feed, FeedFilter, FeedPage, FeedQuery, ReceiptFeed, ReceiptRecord};
pub use rpc::{RetryPolicy, RpcClient};
pub use stream::{
    ConnectionState, Connector, InboundEnvelope, Payload, ReconnectConfig, StreamConfig,
    StreamConnection, StreamEvent, TungsteniteConnector,
};
pub use transport::{TlsMode, TransportConfig};
