//! Per-exchange protocol capability contract
//!
//! Every exchange differs in framing (plain JSON vs gzip vs zlib), batching
//! (single message vs array), heartbeat direction and acknowledgement
//! requirements. The router and connection manager are written once against
//! this contract; adding an exchange means implementing only this trait.

use serde_json::Value;

use crate::error::FeedResult;
use crate::transport::Frame;

/// Classification of one decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    Pong,
    SubscribeAck,
    Data,
    Unknown,
}

pub trait ProtocolAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn endpoint(&self) -> &str;

    /// Decode one raw frame into zero or more semantic messages. Some
    /// exchanges batch a JSON array of independent updates per frame; those
    /// are exploded into one message per element.
    fn decode_frame(&self, frame: &Frame) -> FeedResult<Vec<Value>>;

    fn classify(&self, msg: &Value) -> MessageKind;

    /// Heartbeat timestamps; 0 means not applicable.
    fn parse_ping_timestamp(&self, _msg: &Value) -> i64 {
        0
    }

    fn parse_pong_timestamp(&self, _msg: &Value) -> i64 {
        0
    }

    /// None means this exchange has no application-level heartbeat in that
    /// direction.
    fn build_ping(&self, _timestamp: i64) -> Option<Value> {
        None
    }

    fn build_pong(&self, _timestamp: i64) -> Option<Value> {
        None
    }

    fn requires_subscribe_ack(&self) -> bool;

    fn build_subscribe_request(&self, topic: &str) -> Value;

    fn parse_subscribe_ack_id(&self, _msg: &Value) -> String {
        String::new()
    }

    /// Empty string means the ack reports success.
    fn parse_subscribe_ack_error(&self, _msg: &Value) -> String {
        String::new()
    }

    fn extract_topic(&self, msg: &Value) -> String;

    /// Full set of topics this exchange instance subscribes to at startup.
    /// Enumeration order is deterministic.
    fn topic_catalog(&self) -> Vec<String>;
}
