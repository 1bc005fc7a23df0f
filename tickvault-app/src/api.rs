//! HTTP stats endpoint
//!
//! Exposes the feed counters as JSON so operators can check a running
//! capture without touching the data files.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use warp::{Filter, Rejection, Reply};

use tickvault_core::StatsRegistry;

/// Serves GET /health and GET /stats until the process exits.
pub async fn serve(stats: Arc<StatsRegistry>, addr: SocketAddr) {
    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&json!({
            "status": "ok",
            "service": "tickvault",
            "timestamp": tickvault_core::now_millis(),
        }))
    });

    let stats_route = warp::path("stats")
        .and(warp::get())
        .and(with_stats(stats))
        .and_then(get_stats);

    let routes = health.or(stats_route);

    tracing::info!(%addr, "stats endpoint listening");
    warp::serve(routes).run(addr).await;
}

fn with_stats(
    stats: Arc<StatsRegistry>,
) -> impl Filter<Extract = (Arc<StatsRegistry>,), Error = Infallible> + Clone {
    warp::any().map(move || stats.clone())
}

async fn get_stats(stats: Arc<StatsRegistry>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&stats.snapshot()))
}
