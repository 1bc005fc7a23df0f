//! Protocol router
//!
//! Consumes frames from the connection manager, classifies them through the
//! active adapter, answers heartbeats, correlates subscribe acks and
//! dispatches data messages to per-topic listeners. Re-issues all held
//! subscriptions after a reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::adapter::{MessageKind, ProtocolAdapter};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::{FeedError, FeedResult};
use crate::now_millis;
use crate::stats::StatsRegistry;
use crate::transport::Frame;

/// Per-topic callback, invoked synchronously from the dispatch worker. A
/// slow listener stalls frame processing for this connection; callers that
/// need isolation should hand off to their own queue inside the listener.
pub type Listener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub heartbeat_interval: Duration,
    /// None blocks subscribe() indefinitely on a silent peer.
    pub ack_timeout: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            ack_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Default)]
struct RouterState {
    /// Registration order; reconnect replay follows it.
    order: Vec<String>,
    listeners: HashMap<String, Listener>,
    /// Topics a wire-level subscribe was sent for on the current epoch.
    requested: HashSet<String>,
    /// Ack correlation slots, keyed by the adapter's ack id.
    pending: HashMap<String, oneshot::Sender<Value>>,
}

pub struct Router {
    conn: Arc<ConnectionManager>,
    adapter: Arc<dyn ProtocolAdapter>,
    stats: Arc<StatsRegistry>,
    config: RouterConfig,
    state: Mutex<RouterState>,
    /// Millis timestamp of the last confirmed liveness signal.
    last_liveness: AtomicI64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Creates the router and spawns its dispatch, heartbeat and reconnect
    /// recovery workers.
    pub fn new(
        conn: Arc<ConnectionManager>,
        adapter: Arc<dyn ProtocolAdapter>,
        stats: Arc<StatsRegistry>,
        config: RouterConfig,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            conn,
            adapter,
            stats,
            config,
            state: Mutex::new(RouterState::default()),
            last_liveness: AtomicI64::new(now_millis()),
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(Self::dispatch_loop(router.clone())),
            tokio::spawn(Self::heartbeat_loop(router.clone())),
            tokio::spawn(Self::recovery_loop(router.clone())),
        ];
        *router.tasks.lock() = tasks;
        router
    }

    /// Registers a listener for a topic. The first call for a topic sends
    /// the wire-level subscribe request and, where the adapter requires
    /// acknowledgements, blocks until the ack arrives (bounded by
    /// `ack_timeout`). Re-subscribing an already-requested topic replaces
    /// the listener without any wire traffic.
    pub async fn subscribe(&self, topic: &str, listener: Listener) -> FeedResult<()> {
        self.conn.wait_connected().await?;

        let ack_rx = {
            let mut st = self.state.lock();
            st.listeners.insert(topic.to_string(), listener);
            if !st.order.iter().any(|t| t == topic) {
                st.order.push(topic.to_string());
            }
            if st.requested.contains(topic) {
                debug!(topic, "already requested, listener replaced");
                return Ok(());
            }
            st.requested.insert(topic.to_string());
            if self.adapter.requires_subscribe_ack() {
                let (tx, rx) = oneshot::channel();
                st.pending.insert(topic.to_string(), tx);
                Some(rx)
            } else {
                None
            }
        };

        info!(topic, "subscribing");
        let request = self.adapter.build_subscribe_request(topic);
        if let Err(e) = self.send_json(&request).await {
            self.state.lock().pending.remove(topic);
            return Err(e);
        }

        let Some(rx) = ack_rx else {
            return Ok(());
        };

        let ack = match self.config.ack_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.state.lock().pending.remove(topic);
                    return Err(FeedError::AckTimeout(topic.to_string()));
                }
            },
            None => rx.await,
        };

        match ack {
            Ok(msg) => {
                let err = self.adapter.parse_subscribe_ack_error(&msg);
                if err.is_empty() {
                    Ok(())
                } else {
                    // Subscription stays registered for reconnect replay;
                    // the caller decides whether to unsubscribe.
                    Err(FeedError::Subscription(err))
                }
            }
            // The correlation slot was dropped: connection turnover or
            // shutdown while we were waiting.
            Err(_) => {
                if self.conn.is_closed() {
                    Err(FeedError::Closed)
                } else {
                    Err(FeedError::Reconnected(topic.to_string()))
                }
            }
        }
    }

    /// Removes the local listener. No wire-level unsubscribe exists on all
    /// exchanges; inbound data for the topic is simply dropped.
    pub fn unsubscribe(&self, topic: &str) {
        let mut st = self.state.lock();
        st.listeners.remove(topic);
        st.order.retain(|t| t != topic);
        info!(topic, "unsubscribed");
    }

    /// Tears down the connection manager and stops the router workers. Any
    /// blocked subscribe() callers wake with Closed.
    pub async fn close(&self) -> FeedResult<()> {
        self.conn.close().await?;
        {
            let mut st = self.state.lock();
            st.pending.clear();
            st.listeners.clear();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn send_json(&self, msg: &Value) -> FeedResult<()> {
        trace!(payload = %msg, "send");
        self.conn.write(Frame::Text(msg.to_string())).await?;
        self.stats.update_on_send();
        Ok(())
    }

    /// Single consumer of the frame queue: ping handling, ack resolution
    /// and data dispatch happen strictly in frame-arrival order.
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let frame = match self.conn.read_next().await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let msgs = match self.adapter.decode_frame(&frame) {
                Ok(msgs) => msgs,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };
            for msg in msgs {
                self.handle_message(msg).await;
            }
        }
        debug!("dispatch loop ended");
    }

    async fn handle_message(&self, msg: Value) {
        match self.adapter.classify(&msg) {
            MessageKind::Ping => {
                let t = self.adapter.parse_ping_timestamp(&msg);
                if t > 0 {
                    if let Some(pong) = self.adapter.build_pong(t) {
                        if let Err(e) = self.send_json(&pong).await {
                            warn!(error = %e, "failed to answer ping");
                        }
                    }
                }
            }
            MessageKind::Pong => {
                let t = self.adapter.parse_pong_timestamp(&msg);
                if t > 0 {
                    self.last_liveness.store(t, Ordering::SeqCst);
                }
            }
            MessageKind::SubscribeAck => {
                let id = self.adapter.parse_subscribe_ack_id(&msg);
                let waiter = self.state.lock().pending.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => debug!(%id, "subscribe ack with no waiter, dropped"),
                }
            }
            MessageKind::Data => {
                // Data is a liveness signal too; exchanges without an
                // application heartbeat stay alive on frame flow alone.
                self.last_liveness.store(now_millis(), Ordering::SeqCst);
                let topic = self.adapter.extract_topic(&msg);
                if topic.is_empty() {
                    return;
                }
                let listener = self.state.lock().listeners.get(&topic).cloned();
                match listener {
                    Some(listener) => {
                        self.stats.update_on_recv(&topic);
                        listener(&topic, &msg);
                    }
                    None => trace!(%topic, "no listener, message discarded"),
                }
            }
            MessageKind::Unknown => {
                warn!(message = %msg, "unknown message, discarded");
            }
        }
    }

    /// Periodic outbound ping plus staleness check: silence longer than
    /// twice the heartbeat interval forces one reconnect per stale period.
    async fn heartbeat_loop(self: Arc<Self>) {
        let interval_ms = self.config.heartbeat_interval.as_millis() as i64;
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.conn.is_closed() {
                break;
            }
            let now = now_millis();
            if let Some(ping) = self.adapter.build_ping(now) {
                if let Err(e) = self.send_json(&ping).await {
                    debug!(error = %e, "heartbeat send failed");
                }
            }
            let last = self.last_liveness.load(Ordering::SeqCst);
            if now - last > 2 * interval_ms && self.conn.auto_reconnect_enabled() {
                warn!(now, last, "liveness lost, forcing reconnect");
                // re-arm the clock so one stale period triggers one reconnect
                self.last_liveness.store(now, Ordering::SeqCst);
                self.conn.force_reconnect();
            }
        }
    }

    /// Watches connection epochs; on every epoch after the first, fails
    /// pending ack waits and replays all held subscriptions in registration
    /// order, fire-and-forget.
    async fn recovery_loop(self: Arc<Self>) {
        let mut state_rx = self.conn.state_watcher();
        let mut last_epoch = 0u64;
        loop {
            {
                let state = *state_rx.borrow();
                if state.status == ConnectionStatus::Connected && state.epoch > last_epoch {
                    let first_epoch = last_epoch == 0;
                    last_epoch = state.epoch;
                    self.last_liveness.store(now_millis(), Ordering::SeqCst);
                    if !first_epoch {
                        self.resubscribe_all().await;
                    }
                }
            }
            if state_rx.changed().await.is_err() || self.conn.is_closed() {
                break;
            }
        }
        debug!("recovery loop ended");
    }

    async fn resubscribe_all(&self) {
        let topics = {
            let mut st = self.state.lock();
            // Waiters from the previous epoch are failed; their
            // subscriptions stay registered and are replayed below.
            st.pending.clear();
            st.requested = st.order.iter().cloned().collect();
            st.order.clone()
        };
        for topic in &topics {
            let request = self.adapter.build_subscribe_request(topic);
            if let Err(e) = self.send_json(&request).await {
                warn!(%topic, error = %e, "resubscribe failed");
            }
        }
        if !topics.is_empty() {
            info!(count = topics.len(), "resubscribed after reconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::connection::ConnectionConfig;
    use crate::testutil::{MockConnector, MockSession, TestAdapter};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn fast_conn_config() -> ConnectionConfig {
        ConnectionConfig {
            queue_capacity: 32,
            backoff: ExponentialBackoff {
                initial: Duration::from_millis(1),
                multiplier: 2.0,
                max_interval: Duration::from_millis(5),
            },
        }
    }

    fn quiet_router_config() -> RouterConfig {
        RouterConfig {
            // long enough that heartbeats never interfere with a test
            heartbeat_interval: Duration::from_secs(60),
            ack_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn setup(
        require_ack: bool,
        config: RouterConfig,
    ) -> (Arc<Router>, Arc<StatsRegistry>, mpsc::UnboundedReceiver<MockSession>) {
        setup_with(TestAdapter {
            require_ack,
            heartbeat: true,
        }, config)
    }

    fn setup_with(
        adapter: TestAdapter,
        config: RouterConfig,
    ) -> (Arc<Router>, Arc<StatsRegistry>, mpsc::UnboundedReceiver<MockSession>) {
        let (connector, sessions) = MockConnector::new(0);
        let conn = ConnectionManager::new(Box::new(connector), fast_conn_config());
        let stats = Arc::new(StatsRegistry::new());
        let adapter: Arc<dyn ProtocolAdapter> = Arc::new(adapter);
        let router = Router::new(conn, adapter, stats.clone(), config);
        (router, stats, sessions)
    }

    fn recording_listener() -> (Listener, Arc<Mutex<Vec<(String, Value)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |topic: &str, msg: &Value| {
            sink.lock().push((topic.to_string(), msg.clone()));
        });
        (listener, seen)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn subscribe_with_ack_then_data_dispatch() {
        let (router, stats, mut sessions) = setup(true, quiet_router_config());
        let mut session = sessions.recv().await.unwrap();
        let (listener, seen) = recording_listener();

        let sub = {
            let router = router.clone();
            tokio::spawn(async move { router.subscribe("btcusdt@trade", listener).await })
        };

        let request = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        assert_eq!(request["sub"], "btcusdt@trade");
        session.push_json(&json!({"id": "btcusdt@trade", "status": "ok"}));
        timeout(WAIT, sub).await.unwrap().unwrap().unwrap();

        session.push_json(&json!({"ch": "btcusdt@trade", "data": {"p": "50000"}}));
        wait_until(|| !seen.lock().is_empty()).await;

        let (topic, msg) = seen.lock()[0].clone();
        assert_eq!(topic, "btcusdt@trade");
        assert_eq!(msg["data"]["p"], "50000");
        assert_eq!(stats.snapshot().count_by_topic["btcusdt@trade"], 1);
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_surfaces_ack_error() {
        let (router, _stats, mut sessions) = setup(true, quiet_router_config());
        let mut session = sessions.recv().await.unwrap();
        let (listener, _) = recording_listener();

        let sub = {
            let router = router.clone();
            tokio::spawn(async move { router.subscribe("bogus.topic", listener).await })
        };
        timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        session.push_json(&json!({"id": "bogus.topic", "status": "error", "err-msg": "invalid symbol"}));

        let result = timeout(WAIT, sub).await.unwrap().unwrap();
        match result {
            Err(FeedError::Subscription(msg)) => assert_eq!(msg, "invalid symbol"),
            other => panic!("expected subscription error, got {:?}", other.map(|_| ())),
        }
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn resubscribe_replaces_listener_without_wire_traffic() {
        let (router, _stats, mut sessions) = setup(false, quiet_router_config());
        let mut session = sessions.recv().await.unwrap();
        let (listener_a, seen_a) = recording_listener();
        let (listener_b, seen_b) = recording_listener();

        router.subscribe("alpha.trade", listener_a).await.unwrap();
        let first = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        assert_eq!(first["sub"], "alpha.trade");

        router.subscribe("alpha.trade", listener_b).await.unwrap();
        // the next wire request must belong to a different topic
        router.subscribe("beta.trade", Arc::new(|_, _| {})).await.unwrap();
        let second = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        assert_eq!(second["sub"], "beta.trade");

        session.push_json(&json!({"ch": "alpha.trade", "seq": 1}));
        wait_until(|| !seen_b.lock().is_empty()).await;
        assert!(seen_a.lock().is_empty());
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn data_dispatch_preserves_frame_order() {
        let (router, _stats, mut sessions) = setup(false, quiet_router_config());
        let session = sessions.recv().await.unwrap();
        let (listener, seen) = recording_listener();

        router.subscribe("alpha.trade", listener.clone()).await.unwrap();
        router.subscribe("beta.trade", listener).await.unwrap();

        for i in 0..20 {
            let topic = if i % 2 == 0 { "alpha.trade" } else { "beta.trade" };
            session.push_json(&json!({"ch": topic, "seq": i}));
        }
        wait_until(|| seen.lock().len() == 20).await;

        let seqs: Vec<i64> = seen.lock().iter().map(|(_, m)| m["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_frame_does_not_affect_subsequent_frames() {
        let (router, _stats, mut sessions) = setup(false, quiet_router_config());
        let session = sessions.recv().await.unwrap();
        let (listener, seen) = recording_listener();
        router.subscribe("alpha.trade", listener).await.unwrap();

        session.push_text("definitely not json");
        session.push_json(&json!({"ch": "alpha.trade", "seq": 7}));

        wait_until(|| !seen.lock().is_empty()).await;
        assert_eq!(seen.lock()[0].1["seq"], 7);
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn server_ping_gets_ponged_and_not_dispatched() {
        let (router, _stats, mut sessions) = setup(false, quiet_router_config());
        let mut session = sessions.recv().await.unwrap();
        let (listener, seen) = recording_listener();
        router.subscribe("alpha.trade", listener).await.unwrap();
        // drain the subscribe request
        timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();

        session.push_json(&json!({"ping": 123456}));
        let pong = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        assert_eq!(pong, json!({"pong": 123456}));
        assert!(seen.lock().is_empty());
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_replays_subscriptions_in_registration_order() {
        let (router, _stats, mut sessions) = setup(false, quiet_router_config());
        let mut session = sessions.recv().await.unwrap();
        let (listener, seen) = recording_listener();

        router.subscribe("alpha.trade", listener.clone()).await.unwrap();
        router.subscribe("beta.trade", listener).await.unwrap();
        timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();

        // sever the transport; the manager reconnects and the router replays
        drop(session);
        let mut session = timeout(WAIT, sessions.recv()).await.unwrap().unwrap();

        let first = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        let second = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        assert_eq!(first["sub"], "alpha.trade");
        assert_eq!(second["sub"], "beta.trade");

        // original listener still attached
        session.push_json(&json!({"ch": "beta.trade", "seq": 99}));
        wait_until(|| !seen.lock().is_empty()).await;
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_fails_pending_ack_waits() {
        let (router, _stats, mut sessions) = setup(true, quiet_router_config());
        let mut session = sessions.recv().await.unwrap();
        let (listener, _) = recording_listener();

        let sub = {
            let router = router.clone();
            tokio::spawn(async move { router.subscribe("alpha.trade", listener).await })
        };
        timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();

        drop(session);
        let mut session = timeout(WAIT, sessions.recv()).await.unwrap().unwrap();

        let result = timeout(WAIT, sub).await.unwrap().unwrap();
        assert!(matches!(result, Err(FeedError::Reconnected(_))));

        // the subscription itself was retained and replayed
        let replay = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        assert_eq!(replay["sub"], "alpha.trade");
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn stale_liveness_forces_a_reconnect() {
        let config = RouterConfig {
            heartbeat_interval: Duration::from_millis(25),
            ack_timeout: None,
        };
        let (router, _stats, mut sessions) = setup(false, config);
        let _session = sessions.recv().await.unwrap();

        // no pongs ever arrive, so the router must force a reconnect
        let reconnected = timeout(Duration::from_secs(2), sessions.recv()).await;
        assert!(reconnected.is_ok());
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn data_frames_keep_a_no_heartbeat_stream_alive() {
        let config = RouterConfig {
            heartbeat_interval: Duration::from_millis(25),
            ack_timeout: None,
        };
        let adapter = TestAdapter {
            require_ack: false,
            heartbeat: false,
        };
        let (router, _stats, mut sessions) = setup_with(adapter, config);
        let session = sessions.recv().await.unwrap();
        let (listener, seen) = recording_listener();
        router.subscribe("alpha.trade", listener).await.unwrap();

        // steady data flow across many heartbeat cycles, never a pong:
        // liveness must ride on the data frames themselves
        for i in 0..30 {
            session.push_json(&json!({"ch": "alpha.trade", "seq": i}));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(
            sessions.try_recv().is_err(),
            "healthy data-flowing connection was reconnected"
        );
        assert!(!seen.lock().is_empty());
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn gzip_ping_frame_is_answered_end_to_end() {
        use crate::adapters::HuobiAdapter;
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let (connector, mut sessions) = MockConnector::new(0);
        let conn = ConnectionManager::new(Box::new(connector), fast_conn_config());
        let stats = Arc::new(StatsRegistry::new());
        let adapter: Arc<dyn ProtocolAdapter> = Arc::new(HuobiAdapter::new());
        let router = Router::new(conn, adapter, stats, quiet_router_config());

        let mut session = sessions.recv().await.unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(br#"{"ping":123456}"#).unwrap();
        session.push_binary(enc.finish().unwrap());

        let pong = timeout(WAIT, session.next_sent_json()).await.unwrap().unwrap();
        assert_eq!(pong, json!({"pong": 123456}));
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_dropped() {
        let (router, stats, mut sessions) = setup(false, quiet_router_config());
        let session = sessions.recv().await.unwrap();
        let (listener, seen) = recording_listener();

        router.subscribe("alpha.trade", listener.clone()).await.unwrap();
        session.push_json(&json!({"ch": "alpha.trade", "seq": 1}));
        wait_until(|| !seen.lock().is_empty()).await;

        router.unsubscribe("alpha.trade");
        session.push_json(&json!({"ch": "alpha.trade", "seq": 2}));
        // marker on a still-subscribed topic proves the dropped one was seen
        router.subscribe("beta.trade", listener).await.unwrap();
        session.push_json(&json!({"ch": "beta.trade", "seq": 3}));
        wait_until(|| seen.lock().len() == 2).await;

        assert_eq!(seen.lock()[1].0, "beta.trade");
        assert_eq!(stats.snapshot().count_by_topic["alpha.trade"], 1);
        router.close().await.unwrap();
    }
}
