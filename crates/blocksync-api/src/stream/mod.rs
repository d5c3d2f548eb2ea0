// Persistent envelope stream: codec, backoff, transport seam, connection actor.

pub mod backoff;
pub mod connection;
pub mod envelope;
pub mod memory;
pub mod socket;

pub use backoff::{ReconnectConfig, backoff_delay};
pub use connection::{ConnectionState, StreamConfig, StreamConnection, StreamEvent};
pub use envelope::{HEARTBEAT_FRAME, InboundEnvelope, OutboundMessage, Payload};
pub use memory::{ConnectPlan, MemoryConnector, MemorySession};
pub use socket::{Connector, Frame, Transport, TungsteniteConnector};
