//! Feed error types

use thiserror::Error;

/// Custom result type for feed operations
pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Subscription rejected: {0}")]
    Subscription(String),

    #[error("Timed out waiting for subscribe ack on {0}")]
    AckTimeout(String),

    #[error("Connection was re-established while waiting for ack on {0}")]
    Reconnected(String),

    #[error("Connection closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FeedError {
    /// Whether the fault is contained by the connection manager's retry loop
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Decode(_))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
