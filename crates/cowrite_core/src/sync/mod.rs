//! Client-side synchronization: transport, outbound coalescing, and the
//! agent that ties them to the server protocol.

pub mod agent;
pub mod batcher;
pub mod tokio_transport;
pub mod transport;

pub use agent::{
    AgentConfig, AgentEvent, AgentEventHandler, Lifecycle, ReconnectConfig, SyncAgent,
};
pub use batcher::{
    AwarenessSnapshot, AwarenessThrottler, ConcatMerger, UpdateBatcher, UpdateMerger,
    encode_awareness,
};
pub use tokio_transport::{TokioConnector, TokioTransport};
pub use transport::{SyncTransport, TransportConnector, TransportError, WsMessage};
