//! Scripted transports and a plain-JSON adapter for tests

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::adapter::{MessageKind, ProtocolAdapter};
use crate::error::{FeedError, FeedResult};
use crate::transport::{Frame, FrameSink, FrameSource, TransportConnector};

/// Test-side handle to one mock connection epoch. Dropping it severs the
/// transport, which the read pump observes as a transport error.
pub struct MockSession {
    pub incoming: mpsc::UnboundedSender<Frame>,
    pub outgoing: mpsc::UnboundedReceiver<Frame>,
}

impl MockSession {
    pub fn push_text(&self, text: &str) {
        let _ = self.incoming.send(Frame::Text(text.to_string()));
    }

    pub fn push_json(&self, msg: &Value) {
        self.push_text(&msg.to_string());
    }

    pub fn push_binary(&self, data: Vec<u8>) {
        let _ = self.incoming.send(Frame::Binary(data));
    }

    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.outgoing.recv().await
    }

    pub async fn next_sent_json(&mut self) -> Option<Value> {
        self.next_sent()
            .await
            .and_then(|frame| serde_json::from_slice(frame.payload()).ok())
    }
}

/// Connector that refuses the first `fail_first` attempts, then hands a
/// fresh session to the test on every successful connect.
pub struct MockConnector {
    fail_first: AtomicU32,
    sessions: mpsc::UnboundedSender<MockSession>,
}

impl MockConnector {
    pub fn new(fail_first: u32) -> (Self, mpsc::UnboundedReceiver<MockSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                fail_first: AtomicU32::new(fail_first),
                sessions: tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    fn endpoint(&self) -> &str {
        "ws://mock.test/stream"
    }

    async fn connect(&self) -> FeedResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(FeedError::Transport("connection refused".to_string()));
        }
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = self.sessions.send(MockSession {
            incoming: in_tx,
            outgoing: out_rx,
        });
        Ok((
            Box::new(MockSink { tx: out_tx }),
            Box::new(MockSource { rx: in_rx }),
        ))
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv(&mut self) -> FeedResult<Frame> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| FeedError::Transport("peer hung up".to_string()))
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Frame) -> FeedResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| FeedError::Transport("sink closed".to_string()))
    }

    async fn close(&mut self) -> FeedResult<()> {
        Ok(())
    }
}

/// Huobi-shaped protocol over uncompressed JSON, so router tests can script
/// frames without gzip plumbing. `heartbeat: false` models exchanges with no
/// application-level ping/pong.
pub struct TestAdapter {
    pub require_ack: bool,
    pub heartbeat: bool,
}

impl ProtocolAdapter for TestAdapter {
    fn name(&self) -> &str {
        "test"
    }

    fn endpoint(&self) -> &str {
        "ws://mock.test/stream"
    }

    fn decode_frame(&self, frame: &Frame) -> FeedResult<Vec<Value>> {
        let msg: Value = serde_json::from_slice(frame.payload())?;
        match msg {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    fn classify(&self, msg: &Value) -> MessageKind {
        if msg.get("ping").is_some() {
            MessageKind::Ping
        } else if msg.get("pong").is_some() {
            MessageKind::Pong
        } else if msg.get("ch").is_some() {
            MessageKind::Data
        } else if msg.get("status").is_some() && msg.get("id").is_some() {
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
        self.heartbeat.then(|| json!({ "ping": timestamp }))
    }

    fn build_pong(&self, timestamp: i64) -> Option<Value> {
        self.heartbeat.then(|| json!({ "pong": timestamp }))
    }

    fn requires_subscribe_ack(&self) -> bool {
        self.require_ack
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
        vec!["alpha.trade".to_string(), "beta.trade".to_string()]
    }
}
