//! tickvault capture binary
//!
//! Connects to one exchange, subscribes to the adapter's full topic
//! catalog and archives every data message into hour-rotated gzip
//! jsonlines files. Optionally serves feed statistics over HTTP.

mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tickvault_core::{
    adapter_for, ConnectionConfig, ConnectionManager, Listener, Router, RouterConfig,
    StatsRegistry, WsConnector,
};
use tickvault_store::{FsStore, Store};

#[derive(Parser, Debug)]
#[command(name = "tickvault", about = "Archive exchange market data streams to disk")]
struct Args {
    /// Exchange to capture: huobi, binance, okex or gdax
    #[arg(long)]
    exchange: String,

    /// Directory the jsonlines.gz buckets are written to
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Bind address for the stats HTTP endpoint, e.g. 127.0.0.1:8080.
    /// Stats are not served when omitted.
    #[arg(long)]
    stats_addr: Option<SocketAddr>,

    /// Application heartbeat interval in seconds
    #[arg(long, default_value_t = 5)]
    heartbeat_secs: u64,

    /// Subscribe ack timeout in seconds; 0 waits forever
    #[arg(long, default_value_t = 30)]
    ack_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let adapter = adapter_for(&args.exchange)?;
    info!(
        exchange = adapter.name(),
        endpoint = adapter.endpoint(),
        data_dir = %args.data_dir.display(),
        "starting capture"
    );

    let stats = Arc::new(StatsRegistry::new());
    if let Some(addr) = args.stats_addr {
        tokio::spawn(api::serve(stats.clone(), addr));
    }

    let connector = WsConnector::new(adapter.endpoint())?;
    let conn = ConnectionManager::new(Box::new(connector), ConnectionConfig::default());
    conn.wait_connected().await?;

    let router_config = RouterConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        ack_timeout: (args.ack_timeout_secs > 0)
            .then(|| Duration::from_secs(args.ack_timeout_secs)),
    };
    let router = Router::new(conn, adapter.clone(), stats.clone(), router_config);

    // File writes stay off the async runtime: listeners hand records to a
    // dedicated writer thread over a bounded channel. A full channel blocks
    // the dispatch worker, which in turn backpressures the frame queue.
    let (record_tx, record_rx) = std::sync::mpsc::sync_channel::<(String, Value)>(1024);
    let mut store = FsStore::new(&args.data_dir).context("create data directory")?;
    let writer = std::thread::spawn(move || {
        for (topic, record) in record_rx {
            if let Err(e) = store.insert(&topic, &record) {
                error!(%topic, error = %e, "failed to persist record");
            }
        }
        if let Err(e) = store.close() {
            error!(error = %e, "failed to close store");
        }
    });

    for topic in adapter.topic_catalog() {
        let listener = store_listener(record_tx.clone());
        if let Err(e) = router.subscribe(&topic, listener).await {
            warn!(%topic, error = %e, "subscribe failed");
        }
    }
    drop(record_tx);
    info!("capture running, press ctrl-c to stop");

    shutdown_signal().await?;
    info!("shutting down");
    router.close().await?;
    drop(router);

    // The listeners held the last channel senders; with the router gone the
    // writer drains whatever is queued and finalizes the gzip trailers.
    tokio::task::spawn_blocking(move || writer.join())
        .await?
        .map_err(|_| anyhow::anyhow!("writer thread panicked"))?;

    let snapshot = stats.snapshot();
    info!(
        received = snapshot.recv_count,
        sent = snapshot.send_count,
        topics = snapshot.count_by_topic.len(),
        "capture finished"
    );
    Ok(())
}

fn store_listener(tx: SyncSender<(String, Value)>) -> Listener {
    Arc::new(move |topic: &str, msg: &Value| {
        if tx.send((topic.to_string(), msg.clone())).is_err() {
            // writer already gone, only possible during shutdown
            warn!(%topic, "record dropped, writer stopped");
        }
    })
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
