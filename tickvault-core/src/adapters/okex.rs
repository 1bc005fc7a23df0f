//! OKEx v1 websocket adapter
//!
//! Frames are zlib-compressed JSON and one frame may carry an array of
//! independent channel updates, which is exploded into one message per
//! element. Heartbeats are `{"event":"ping"}` / `{"event":"pong"}` with no
//! timestamps on the wire, so liveness bookkeeping uses the local clock.

use std::io::Read;

use flate2::read::ZlibDecoder;
use serde_json::{json, Value};

use crate::adapter::{MessageKind, ProtocolAdapter};
use crate::error::FeedResult;
use crate::now_millis;
use crate::transport::Frame;

const ENDPOINT: &str = "wss://real.okex.com:10441/websocket";

const SYMBOLS: &[(&str, &str)] = &[
    ("btc", "usdt"),
    ("bch", "usdt"),
    ("eth", "usdt"),
    ("etc", "usdt"),
    ("ltc", "usdt"),
    ("eos", "usdt"),
    ("xrp", "usdt"),
];

const DATA_TYPES: &[&str] = &["kline", "deals", "ticker", "depth"];

pub struct OkexAdapter;

impl OkexAdapter {
    pub fn new() -> Self {
        Self
    }

    fn make_topic(base: &str, quote: &str, dtype: &str) -> String {
        format!("ok_sub_spot_{}_{}_{}", base, quote, dtype)
    }
}

impl Default for OkexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn inflate(buf: &[u8]) -> FeedResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(buf).read_to_end(&mut out)?;
    Ok(out)
}

impl ProtocolAdapter for OkexAdapter {
    fn name(&self) -> &str {
        "okex"
    }

    fn endpoint(&self) -> &str {
        ENDPOINT
    }

    fn decode_frame(&self, frame: &Frame) -> FeedResult<Vec<Value>> {
        let raw = inflate(frame.payload())?;
        let msg: Value = serde_json::from_slice(&raw)?;
        match msg {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    fn classify(&self, msg: &Value) -> MessageKind {
        match msg.get("event").and_then(Value::as_str) {
            Some("ping") => return MessageKind::Ping,
            Some("pong") => return MessageKind::Pong,
            _ => {}
        }
        if msg.get("channel").is_some() {
            MessageKind::Data
        } else {
            MessageKind::Unknown
        }
    }

    fn parse_ping_timestamp(&self, _msg: &Value) -> i64 {
        now_millis()
    }

    fn parse_pong_timestamp(&self, _msg: &Value) -> i64 {
        now_millis()
    }

    fn build_ping(&self, _timestamp: i64) -> Option<Value> {
        Some(json!({ "event": "ping" }))
    }

    fn build_pong(&self, _timestamp: i64) -> Option<Value> {
        Some(json!({ "event": "pong" }))
    }

    fn requires_subscribe_ack(&self) -> bool {
        false
    }

    fn build_subscribe_request(&self, topic: &str) -> Value {
        json!({ "event": "addChannel", "channel": topic })
    }

    fn extract_topic(&self, msg: &Value) -> String {
        msg.get("channel")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn topic_catalog(&self) -> Vec<String> {
        let mut topics = Vec::with_capacity(SYMBOLS.len() * DATA_TYPES.len());
        for (base, quote) in SYMBOLS {
            for dtype in DATA_TYPES {
                topics.push(Self::make_topic(base, quote, dtype));
            }
        }
        topics
    }
}
