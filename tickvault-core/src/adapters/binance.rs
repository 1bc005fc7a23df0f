//! Binance combined-stream adapter
//!
//! Frames are plain UTF-8 JSON, one message per frame, with the topic in the
//! `stream` field. There is no application-level heartbeat (the ws layer
//! handles pings) and subscribe replies carry no error field worth waiting
//! for, so no acks are required.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use crate::adapter::{MessageKind, ProtocolAdapter};
use crate::error::FeedResult;
use crate::transport::Frame;

const BASE_ENDPOINT: &str = "wss://stream.binance.com:9443/stream?streams=";

const SYMBOLS: &[&str] = &[
    "btcusdt", "bccusdt", "ethusdt", "ltcusdt", "neousdt",
    "bccbtc", "ethbtc", "etcbtc", "neobtc",
    "etceth", "eoseth", "neoeth",
];

const DATA_TYPES: &[&str] = &["kline_1m", "ticker", "depth20", "trade"];

pub struct BinanceAdapter {
    endpoint: String,
    next_request_id: AtomicU64,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        // Topics ride on the connection URL, so the endpoint embeds the
        // full catalog; explicit SUBSCRIBE requests are honored as well.
        let endpoint = format!("{}{}", BASE_ENDPOINT, Self::catalog().join("/"));
        Self {
            endpoint,
            next_request_id: AtomicU64::new(1),
        }
    }

    fn make_topic(symbol: &str, dtype: &str) -> String {
        format!("{}@{}", symbol, dtype)
    }

    fn catalog() -> Vec<String> {
        let mut topics = Vec::with_capacity(SYMBOLS.len() * DATA_TYPES.len());
        for symbol in SYMBOLS {
            for dtype in DATA_TYPES {
                topics.push(Self::make_topic(symbol, dtype));
            }
        }
        topics
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn decode_frame(&self, frame: &Frame) -> FeedResult<Vec<Value>> {
        let msg: Value = serde_json::from_slice(frame.payload())?;
        Ok(vec![msg])
    }

    fn classify(&self, msg: &Value) -> MessageKind {
        if msg.get("stream").is_some() {
            MessageKind::Data
        } else if msg.get("result").is_some() && msg.get("id").is_some() {
            // SUBSCRIBE confirmation; nobody waits on it
            MessageKind::SubscribeAck
        } else {
            MessageKind::Unknown
        }
    }

    fn requires_subscribe_ack(&self) -> bool {
        false
    }

    fn build_subscribe_request(&self, topic: &str) -> Value {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        json!({ "method": "SUBSCRIBE", "params": [topic], "id": id })
    }

    fn extract_topic(&self, msg: &Value) -> String {
        msg.get("stream")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn topic_catalog(&self) -> Vec<String> {
        Self::catalog()
    }
}
