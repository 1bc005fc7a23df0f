//! Huobi spot market adapter
//!
//! Frames are gzip-compressed JSON objects, one message per frame. The
//! server pings with `{"ping": t}` and expects `{"pong": t}` back.
//! Subscriptions are acknowledged with `{"id": topic, "status": ...}`.

use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::{json, Value};

use crate::adapter::{MessageKind, ProtocolAdapter};
use crate::error::FeedResult;
use crate::transport::Frame;

const ENDPOINT: &str = "wss://api.huobi.pro/ws";

const SYMBOLS: &[&str] = &[
    "btc", "bch", "eth", "etc", "ltc", "eos", "xrp", "omg", "dash", "zec",
];

const DATA_TYPES: &[&str] = &["kline.1min", "depth.step0", "trade.detail", "detail"];

pub struct HuobiAdapter;

impl HuobiAdapter {
    pub fn new() -> Self {
        Self
    }

    fn make_topic(base: &str, dtype: &str) -> String {
        format!("market.{}usdt.{}", base, dtype)
    }
}

impl Default for HuobiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn ungzip(buf: &[u8]) -> FeedResult<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(buf).read_to_end(&mut out)?;
    Ok(out)
}

fn has_key(msg: &Value, key: &str) -> bool {
    msg.get(key).is_some()
}

impl ProtocolAdapter for HuobiAdapter {
    fn name(&self) -> &str {
        "huobi"
    }

    fn endpoint(&self) -> &str {
        ENDPOINT
    }

    fn decode_frame(&self, frame: &Frame) -> FeedResult<Vec<Value>> {
        let raw = ungzip(frame.payload())?;
        let msg: Value = serde_json::from_slice(&raw)?;
        Ok(vec![msg])
    }

    fn classify(&self, msg: &Value) -> MessageKind {
        if has_key(msg, "ping") {
            MessageKind::Ping
        } else if has_key(msg, "pong") {
            MessageKind::Pong
        } else if has_key(msg, "ch") {
            MessageKind::Data
        } else if has_key(msg, "status") && has_key(msg, "id") {
            MessageKind::SubscribeAck
        } else {
            MessageKind::Unknown
        }
    }

    fn parse_ping_timestamp(&self, msg: &Value) -> i64 {
        msg.get("ping").and_then(Value::as_i64).unwrap_or(0)
    }

    fn parse_pong_timestamp(&self, msg: &Value) -> i64 {
        msg.get("pong").and_then(Value::as_i64).unwrap_or(0)
    }

    fn build_ping(&self, timestamp: i64) -> Option<Value> {
        Some(json!({ "ping": timestamp }))
    }

    fn build_pong(&self, timestamp: i64) -> Option<Value> {
        Some(json!({ "pong": timestamp }))
    }

    fn requires_subscribe_ack(&self) -> bool {
        true
    }

    fn build_subscribe_request(&self, topic: &str) -> Value {
        json!({ "sub": topic, "id": topic })
    }

    fn parse_subscribe_ack_id(&self, msg: &Value) -> String {
        msg.get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn parse_subscribe_ack_error(&self, msg: &Value) -> String {
        msg.get("err-msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn extract_topic(&self, msg: &Value) -> String {
        msg.get("ch")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn topic_catalog(&self) -> Vec<String> {
        let mut topics = Vec::with_capacity(SYMBOLS.len() * DATA_TYPES.len());
        for symbol in SYMBOLS {
            for dtype in DATA_TYPES {
                topics.push(Self::make_topic(symbol, dtype));
            }
        }
        topics
    }
}
