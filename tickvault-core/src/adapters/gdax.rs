//! GDAX (Coinbase Pro) websocket adapter
//!
//! Frames are plain UTF-8 JSON, one message per frame, tagged with a `type`
//! field. Subscriptions are confirmed with a single `subscriptions` summary
//! rather than per-topic acks, and there is no application-level ping/pong:
//! the `heartbeat` channel is ordinary data, so liveness rides on frame flow.

use serde_json::{json, Value};

use crate::adapter::{MessageKind, ProtocolAdapter};
use crate::error::FeedResult;
use crate::transport::Frame;

const ENDPOINT: &str = "wss://ws-feed.gdax.com";

const PRODUCTS: &[&str] = &[
    "BCH-BTC", "BCH-USD", "BTC-EUR", "BTC-GBP", "BTC-USD",
    "ETH-BTC", "ETH-EUR", "ETH-USD",
    "LTC-BTC", "LTC-EUR", "LTC-USD", "BCH-EUR",
];

const CHANNELS: &[&str] = &["heartbeat", "ticker", "level2", "matches", "full"];

pub struct GdaxAdapter;

impl GdaxAdapter {
    pub fn new() -> Self {
        Self
    }

    fn make_topic(product: &str, channel: &str) -> String {
        format!("{}.{}", product, channel)
    }
}

impl Default for GdaxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages carry their concrete type, not the channel they were subscribed
/// under; fold the types back onto channels so routing matches the catalog.
fn channel_for(message_type: &str) -> &str {
    match message_type {
        "snapshot" | "l2update" => "level2",
        "match" | "last_match" => "matches",
        "received" | "open" | "done" | "change" | "activate" => "full",
        other => other,
    }
}

impl ProtocolAdapter for GdaxAdapter {
    fn name(&self) -> &str {
        "gdax"
    }

    fn endpoint(&self) -> &str {
        ENDPOINT
    }

    fn decode_frame(&self, frame: &Frame) -> FeedResult<Vec<Value>> {
        let msg: Value = serde_json::from_slice(frame.payload())?;
        Ok(vec![msg])
    }

    fn classify(&self, msg: &Value) -> MessageKind {
        match msg.get("type").and_then(Value::as_str) {
            // one summary per subscribe; nobody waits on it
            Some("subscriptions") => MessageKind::SubscribeAck,
            Some(_) => MessageKind::Data,
            None => MessageKind::Unknown,
        }
    }

    fn requires_subscribe_ack(&self) -> bool {
        false
    }

    fn build_subscribe_request(&self, topic: &str) -> Value {
        let (product, channel) = topic.split_once('.').unwrap_or((topic, ""));
        json!({
            "type": "subscribe",
            "product_ids": [product],
            "channels": [channel],
        })
    }

    fn extract_topic(&self, msg: &Value) -> String {
        let message_type = msg.get("type").and_then(Value::as_str).unwrap_or_default();
        let product = msg
            .get("product_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if message_type.is_empty() || product.is_empty() {
            return String::new();
        }
        Self::make_topic(product, channel_for(message_type))
    }

    fn topic_catalog(&self) -> Vec<String> {
        let mut topics = Vec::with_capacity(PRODUCTS.len() * CHANNELS.len());
        for product in PRODUCTS {
            for channel in CHANNELS {
                topics.push(Self::make_topic(product, channel));
            }
        }
        topics
    }
}
