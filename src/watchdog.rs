// Liveness of the hub subscription: the shared event counter must advance every window.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval_at};

use crate::error::CollectorError;

pub struct Watchdog {
    events_received: Arc<AtomicU64>,
    window: Duration,
    /// Source name reported in the timeout error.
    source: String,
}

impl Watchdog {
    pub fn new(events_received: Arc<AtomicU64>, window: Duration, source: impl Into<String>) -> Self {
        Self {
            events_received,
            window,
            source: source.into(),
        }
    }

    /// Returns only when a full window passes without a new event.
    pub async fn run(self) -> CollectorError {
        let mut saved = self.events_received.load(Ordering::Relaxed);
        let start = tokio::time::Instant::now() + self.window;
        let mut tick = interval_at(start, self.window);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let current = self.events_received.load(Ordering::Relaxed);
            if current == saved {
                tracing::error!(
                    source = %self.source,
                    events_received = current,
                    window_secs = self.window.as_secs(),
                    "no events within watchdog window"
                );
                return CollectorError::WatchdogTimeout(self.source);
            }
            tracing::trace!(advanced_by = current.wrapping_sub(saved), "watchdog alive");
            saved = current;
        }
    }
}
