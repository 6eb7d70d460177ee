//! Forwarding counters. Observability only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};

/// Counts confirmed publishes.
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    recent: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one confirmed publish.
    pub fn record(&self) {
        self.recent.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count since the last call, resetting it to zero.
    pub fn take_recent(&self) -> u64 {
        self.recent.swap(0, Ordering::Relaxed)
    }

    /// Count since startup.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Log and reset the recent count once per `period`. Never returns.
    pub async fn report_every(self, period: Duration) {
        let mut interval = interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let n_recent_messages = self.take_recent();
            tracing::info!(n_recent_messages, "messages forwarded to mqtt");
        }
    }
}
