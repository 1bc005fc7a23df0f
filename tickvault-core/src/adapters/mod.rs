//! Concrete exchange adapters and the startup registry

pub mod binance;
pub mod gdax;
pub mod huobi;
pub mod okex;

use std::sync::Arc;

use crate::adapter::ProtocolAdapter;
use crate::error::{FeedError, FeedResult};

pub use binance::BinanceAdapter;
pub use gdax::GdaxAdapter;
pub use huobi::HuobiAdapter;
pub use okex::OkexAdapter;

/// Resolve an exchange name to its adapter. Unknown names fail fast at
/// startup.
pub fn adapter_for(name: &str) -> FeedResult<Arc<dyn ProtocolAdapter>> {
    match name {
        "huobi" => Ok(Arc::new(HuobiAdapter::new())),
        "binance" => Ok(Arc::new(BinanceAdapter::new())),
        "okex" => Ok(Arc::new(OkexAdapter::new())),
        "gdax" => Ok(Arc::new(GdaxAdapter::new())),
        other => Err(FeedError::Config(format!("unknown exchange: {}", other))),
    }
}
