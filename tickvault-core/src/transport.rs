//! Frame-oriented transport abstraction over WebSocket

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{FeedError, FeedResult};

/// One transport-level message exchanged with the remote endpoint.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

/// Receiving half of one live transport
#[async_trait]
pub trait FrameSource: Send {
    /// Blocks until the next frame arrives; errors end the connection epoch.
    async fn recv(&mut self) -> FeedResult<Frame>;
}

/// Sending half of one live transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> FeedResult<()>;
    async fn close(&mut self) -> FeedResult<()>;
}

/// Establishes transports; the connection manager calls this on every
/// (re)connect attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    fn endpoint(&self) -> &str;
    async fn connect(&self) -> FeedResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector over tokio-tungstenite
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(endpoint: &str) -> FeedResult<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| FeedError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
        Ok(Self { url })
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn connect(&self) -> FeedResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let (ws, _) = connect_async(self.url.clone()).await?;
        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsSource { stream })))
    }
}

struct WsSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> FeedResult<Frame> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    return Err(FeedError::Transport(format!("close frame: {:?}", frame)))
                }
                // tungstenite answers ws-level pings itself; application
                // heartbeats are JSON payloads handled by the router
                Some(Ok(other)) => {
                    debug!("ignoring non-data ws message: {:?}", other);
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(FeedError::Transport("stream ended".to_string())),
            }
        }
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> FeedResult<()> {
        let msg = match frame {
            Frame::Text(s) => Message::Text(s),
            Frame::Binary(b) => Message::Binary(b),
        };
        self.sink.send(msg).await?;
        Ok(())
    }

    async fn close(&mut self) -> FeedResult<()> {
        self.sink.send(Message::Close(None)).await?;
        Ok(())
    }
}
