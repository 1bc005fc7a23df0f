//! Durable append-only sink for topic-tagged records

pub mod fs;

use serde_json::Value;
use thiserror::Error;

pub use fs::FsStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only destination keyed by topic. Destinations are created lazily
/// on first insert.
pub trait Store: Send {
    fn insert(&mut self, topic: &str, record: &Value) -> Result<(), StoreError>;

    /// Flushes and releases all open destinations.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// Sink that logs records instead of persisting them; handy for dry runs.
#[derive(Default)]
pub struct NullStore;

impl Store for NullStore {
    fn insert(&mut self, topic: &str, record: &Value) -> Result<(), StoreError> {
        tracing::info!(topic, %record, "discarding record");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
