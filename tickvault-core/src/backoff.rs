//! Exponential backoff policy for connection retries

use std::time::Duration;

/// Reconnect delay policy with no elapsed-time limit. The connection
/// manager retries forever; only the per-attempt delay is bounded.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl ExponentialBackoff {
    /// Delay to apply before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = self.initial.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_interval)
    }
}
