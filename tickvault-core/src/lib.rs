//! tickvault core
//!
//! Connectivity and protocol normalization for streaming exchange feeds: a
//! self-healing connection manager, a per-exchange protocol adapter
//! contract with concrete adapters, and a router that turns raw frames into
//! topic-tagged messages for downstream consumers.

pub mod adapter;
pub mod adapters;
pub mod backoff;
pub mod connection;
pub mod error;
pub mod router;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod testutil;

// Re-export main types for easy access
pub use adapter::{MessageKind, ProtocolAdapter};
pub use adapters::adapter_for;
pub use backoff::ExponentialBackoff;
pub use connection::{ConnState, ConnectionConfig, ConnectionManager, ConnectionStatus};
pub use error::{FeedError, FeedResult};
pub use router::{Listener, Router, RouterConfig};
pub use stats::{StatsRegistry, StatsSnapshot};
pub use transport::{Frame, FrameSink, FrameSource, TransportConnector, WsConnector};

/// Milliseconds since the unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
