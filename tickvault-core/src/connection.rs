//! Self-healing connection manager
//!
//! Owns one transport at a time, reconnects it with exponential backoff on
//! failure and feeds received frames into a bounded queue. Transport faults
//! are fully contained here: `read_next`/`write` callers see a delay during
//! an outage, never a disconnect error, unless the manager is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{FeedError, FeedResult};
use crate::transport::{Frame, FrameSink, FrameSource, TransportConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Broadcast connection state. The epoch increments exactly once per
/// successful (re)connect, so observers can tell epochs apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnState {
    pub status: ConnectionStatus,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded frame queue size; the read pump blocks when it is full
    /// (lossless backpressure rather than drop).
    pub queue_capacity: usize,
    pub backoff: ExponentialBackoff,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            backoff: ExponentialBackoff::default(),
        }
    }
}

pub struct ConnectionManager {
    connector: Box<dyn TransportConnector>,
    config: ConnectionConfig,
    // Write path: one lock serializes all writers and guards the invariant
    // that at most one live sink exists.
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    frame_tx: mpsc::Sender<Frame>,
    frame_rx: Mutex<mpsc::Receiver<Frame>>,
    state_tx: watch::Sender<ConnState>,
    closed_tx: watch::Sender<bool>,
    auto_reconnect: AtomicBool,
    reconnect: Notify,
}

impl ConnectionManager {
    /// Creates the manager and starts its connector/read-pump task. The
    /// returned handle is shared; use `wait_connected` before the first
    /// write.
    pub fn new(connector: Box<dyn TransportConnector>, config: ConnectionConfig) -> Arc<Self> {
        let (frame_tx, frame_rx) = mpsc::channel(config.queue_capacity);
        let (state_tx, _) = watch::channel(ConnState {
            status: ConnectionStatus::Disconnected,
            epoch: 0,
        });
        let (closed_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            connector,
            config,
            sink: Mutex::new(None),
            frame_tx,
            frame_rx: Mutex::new(frame_rx),
            state_tx,
            closed_tx,
            auto_reconnect: AtomicBool::new(true),
            reconnect: Notify::new(),
        });

        tokio::spawn(Self::run(manager.clone()));
        manager
    }

    /// Connector + read pump. Runs until close() or until auto-reconnect is
    /// off and the transport dies.
    async fn run(self: Arc<Self>) {
        let mut closed_rx = self.closed_tx.subscribe();

        'outer: loop {
            if *closed_rx.borrow() {
                break;
            }
            self.set_status(ConnectionStatus::Connecting);

            let (sink, mut source) = match self.connect_with_backoff(&mut closed_rx).await {
                Some(pair) => pair,
                None => break,
            };

            // Install the sink before broadcasting Connected so no observer
            // sees a half-replaced transport.
            *self.sink.lock().await = Some(sink);
            self.state_tx.send_modify(|s| {
                s.status = ConnectionStatus::Connected;
                s.epoch += 1;
            });
            info!(endpoint = self.connector.endpoint(), "connected");

            loop {
                tokio::select! {
                    res = source.recv() => match res {
                        Ok(frame) => {
                            // The queue send can block under backpressure;
                            // forced reconnects must still get through, at
                            // the cost of the in-flight frame.
                            tokio::select! {
                                sent = self.frame_tx.send(frame) => {
                                    if sent.is_err() {
                                        break 'outer;
                                    }
                                }
                                _ = self.reconnect.notified() => {
                                    info!("reconnect forced");
                                    break;
                                }
                                _ = closed_rx.changed() => break 'outer,
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "transport read failed");
                            break;
                        }
                    },
                    _ = self.reconnect.notified() => {
                        info!("reconnect forced");
                        break;
                    }
                    _ = closed_rx.changed() => break 'outer,
                }
            }

            self.drop_transport().await;
            if !self.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }
        }

        self.drop_transport().await;
    }

    async fn connect_with_backoff(
        &self,
        closed_rx: &mut watch::Receiver<bool>,
    ) -> Option<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let mut attempt = 0u32;
        loop {
            if *closed_rx.borrow() {
                return None;
            }
            match self.connector.connect().await {
                Ok(pair) => return Some(pair),
                Err(e) => {
                    let delay = self.config.backoff.delay(attempt);
                    warn!(
                        endpoint = self.connector.endpoint(),
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "connect failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = closed_rx.changed() => return None,
                    }
                }
            }
        }
    }

    async fn drop_transport(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state_tx.send_modify(|s| s.status = status);
    }

    /// Blocks until a frame is available. Returns Closed after close().
    pub async fn read_next(&self) -> FeedResult<Frame> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(FeedError::Closed);
        }
        let mut rx = self.frame_rx.lock().await;
        tokio::select! {
            maybe = rx.recv() => maybe.ok_or(FeedError::Closed),
            _ = closed_rx.changed() => Err(FeedError::Closed),
        }
    }

    /// Sends one frame; concurrent writers serialize on the sink lock.
    pub async fn write(&self, frame: Frame) -> FeedResult<()> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(FeedError::Transport("no live transport".to_string())),
        }
    }

    /// Blocks until the status becomes Connected; returns the epoch.
    pub async fn wait_connected(&self) -> FeedResult<u64> {
        let mut state_rx = self.state_tx.subscribe();
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            if *closed_rx.borrow() {
                return Err(FeedError::Closed);
            }
            let state = *state_rx.borrow();
            if state.status == ConnectionStatus::Connected {
                return Ok(state.epoch);
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(FeedError::Closed);
                    }
                }
                _ = closed_rx.changed() => return Err(FeedError::Closed),
            }
        }
    }

    /// Watch handle over status/epoch transitions; every transition wakes
    /// all watchers.
    pub fn state_watcher(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state_tx.borrow().status
    }

    /// Drops the live transport and lets the reconnect machinery rebuild
    /// it. Used by the router's liveness check.
    pub fn force_reconnect(&self) {
        // notify_waiters: wakes the pump wherever it is parked (transport
        // recv or a backpressured queue send); a request made while no
        // transport is live is a no-op, the reconnect machinery is already
        // running
        self.reconnect.notify_waiters();
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Disables auto-reconnect and tears the transport down. Blocked
    /// readers and waiters wake with Closed.
    pub async fn close(&self) -> FeedResult<()> {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }
}
