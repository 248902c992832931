// Ingestion batcher. The hub callback (producer) only counts and enqueues; the batch writer
// (consumer) groups events by bucket timestamp and writes each bucket as one multi-point write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

use crate::catalog::SensorCatalog;
use crate::error::StoreError;
use crate::models::{Point, SensorDescriptor, SensorEvent};
use crate::store_repo::StoreClient;

/// Field every raw sample is written under.
pub const SAMPLE_FIELD: &str = "sample";

/// Truncates `now` (unix seconds) to the start of its bucket.
pub fn bucket_timestamp(now: i64, bucket_secs: i64) -> i64 {
    if bucket_secs <= 1 {
        return now;
    }
    now.div_euclid(bucket_secs) * bucket_secs
}

/// Handed to the hub subscription; cheap to clone and never blocks.
#[derive(Clone)]
pub struct SampleProducer {
    tx: mpsc::UnboundedSender<SensorEvent>,
    by_key: Arc<HashMap<u32, Arc<SensorDescriptor>>>,
    events_received: Arc<AtomicU64>,
    bucket_secs: i64,
}

impl SampleProducer {
    pub fn new(
        tx: mpsc::UnboundedSender<SensorEvent>,
        catalog: &SensorCatalog,
        events_received: Arc<AtomicU64>,
        bucket_secs: u64,
    ) -> Self {
        Self {
            tx,
            by_key: Arc::new(catalog.by_key.clone()),
            events_received,
            bucket_secs: bucket_secs.max(1) as i64,
        }
    }

    pub fn on_sample(&self, key: u32, value: f64) -> bool {
        self.on_sample_at(key, value, chrono::Utc::now().timestamp())
    }

    /// Counts the event for the watchdog, then enqueues it if the key is known and the value
    /// is usable. Returns whether it was enqueued.
    pub fn on_sample_at(&self, key: u32, value: f64, now_secs: i64) -> bool {
        let arrival_order = self.events_received.fetch_add(1, Ordering::Relaxed);
        let Some(sensor) = self.by_key.get(&key) else {
            tracing::trace!(key, "sample for unknown key dropped");
            return false;
        };
        if !value.is_finite() {
            tracing::debug!(sensor = %sensor.name, "unusable sample dropped");
            return false;
        }
        let event = SensorEvent {
            sensor: sensor.clone(),
            value,
            timestamp: bucket_timestamp(now_secs, self.bucket_secs),
            arrival_order,
        };
        self.tx.send(event).is_ok()
    }
}

/// Events of one bucket, in arrival order.
#[derive(Debug, Default)]
pub struct Batch {
    timestamp: Option<i64>,
    events: Vec<SensorEvent>,
}

impl Batch {
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Adds `event`. If it opens a new bucket, the previous bucket's events are returned
    /// first and the batch restarts at the new timestamp.
    pub fn push(&mut self, event: SensorEvent) -> Option<Vec<SensorEvent>> {
        let completed = match self.timestamp {
            Some(ts) if ts != event.timestamp => Some(self.take()),
            _ => None,
        };
        self.timestamp = Some(event.timestamp);
        self.events.push(event);
        completed.filter(|events| !events.is_empty())
    }

    pub fn take(&mut self) -> Vec<SensorEvent> {
        self.timestamp = None;
        std::mem::take(&mut self.events)
    }
}

/// Converts one bucket into points. Events missing a measurement or device are dropped.
pub fn batch_to_points(events: &[SensorEvent]) -> Vec<Point> {
    events
        .iter()
        .filter_map(|event| {
            let sensor = &event.sensor;
            if sensor.measurement.is_empty() || sensor.device.is_empty() {
                tracing::warn!(
                    sensor = %sensor.name,
                    operation = "batch_to_points",
                    "sensor lacks measurement or device; sample dropped"
                );
                return None;
            }
            let point = Point::new(
                &sensor.measurement,
                SAMPLE_FIELD,
                sensor.round(event.value),
                event.timestamp,
            )
            .tag("_device", &sensor.device)
            .tag("_location", sensor.location().unwrap_or_default());
            Some(point)
        })
        .collect()
}

/// Counters published by the batch writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub points_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub batches_dropped: AtomicU64,
}

pub struct BatchWriterConfig {
    pub stats_log_interval_secs: u64,
}

/// Spawns the consumer. It flushes whenever a new bucket starts and once more when the
/// channel closes.
pub fn spawn_batch_writer(
    mut rx: mpsc::UnboundedReceiver<SensorEvent>,
    store: Arc<dyn StoreClient>,
    events_received: Arc<AtomicU64>,
    stats: Arc<WriterStats>,
    config: BatchWriterConfig,
) -> tokio::task::JoinHandle<()> {
    let stats_log_interval = Duration::from_secs(config.stats_log_interval_secs.max(1));
    tokio::spawn(async move {
        let mut batch = Batch::default();
        let mut stats_log_tick = interval(stats_log_interval);
        stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Some(event) => {
                            if let Some(completed) = batch.push(event) {
                                flush(store.as_ref(), &completed, &stats).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = stats_log_tick.tick() => {
                    tracing::info!(
                        events_received = events_received.load(Ordering::Relaxed),
                        points_written = stats.points_written.load(Ordering::Relaxed),
                        batches_written = stats.batches_written.load(Ordering::Relaxed),
                        batches_dropped = stats.batches_dropped.load(Ordering::Relaxed),
                        "collector stats"
                    );
                }
            }
        }
        let remaining = batch.take();
        flush(store.as_ref(), &remaining, &stats).await;
        tracing::debug!("Batch writer shutting down");
    })
}

async fn flush(store: &dyn StoreClient, events: &[SensorEvent], stats: &WriterStats) {
    if events.is_empty() {
        return;
    }
    let points = batch_to_points(events);
    if points.is_empty() {
        return;
    }
    let n = points.len();
    match store.write(&points).await {
        Ok(()) => {
            stats.points_written.fetch_add(n as u64, Ordering::Relaxed);
            stats.batches_written.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(operation = "write_batch", points_count = n, "Batch written");
        }
        Err(e @ (StoreError::Rejected { .. } | StoreError::Format(_))) => {
            stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, operation = "write_batch", points_count = n, "malformed batch dropped");
        }
        Err(e) => {
            stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, operation = "write_batch", points_count = n, "batch write failed; dropped");
        }
    }
}
