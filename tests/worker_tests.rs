// Ingestion batcher: producer counting, bucket grouping and writer flushes

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{MemoryStore, descriptor, entity, event, sensor_config};
use energy_collector::catalog::SensorCatalog;
use energy_collector::error::StoreError;
use energy_collector::worker::{
    Batch, BatchWriterConfig, SampleProducer, WriterStats, batch_to_points, bucket_timestamp,
    spawn_batch_writer,
};
use tokio::sync::mpsc;

fn catalog() -> SensorCatalog {
    SensorCatalog::build(
        &[
            sensor_config("line1_power", "line1", Some("kitchen"), true),
            sensor_config("line2_power", "line2", None, true),
        ],
        &[entity("line1_power", 101, Some(1)), entity("line2_power", 102, Some(0))],
    )
}

#[test]
fn bucket_timestamp_truncates_to_granularity() {
    assert_eq!(bucket_timestamp(1_700_000_009, 10), 1_700_000_000);
    assert_eq!(bucket_timestamp(1_700_000_010, 10), 1_700_000_010);
    assert_eq!(bucket_timestamp(1_700_000_059, 60), 1_700_000_040);
    assert_eq!(bucket_timestamp(1_700_000_059, 1), 1_700_000_059);
}

#[test]
fn producer_counts_every_event_but_enqueues_only_known_usable_ones() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = Arc::new(AtomicU64::new(0));
    let producer = SampleProducer::new(tx, &catalog(), counter.clone(), 10);

    assert!(producer.on_sample_at(101, 230.45, 1_700_000_003));
    assert!(!producer.on_sample_at(999, 1.0, 1_700_000_004));
    assert!(!producer.on_sample_at(102, f64::NAN, 1_700_000_005));
    assert!(producer.on_sample_at(102, 12.0, 1_700_000_011));

    assert_eq!(counter.load(Ordering::Relaxed), 4);

    let first = rx.try_recv().unwrap();
    assert_eq!(first.sensor.name, "line1_power");
    assert_eq!(first.timestamp, 1_700_000_000);
    assert_eq!(first.arrival_order, 0);

    let second = rx.try_recv().unwrap();
    assert_eq!(second.sensor.name, "line2_power");
    assert_eq!(second.timestamp, 1_700_000_010);
    assert_eq!(second.arrival_order, 3);
    assert!(rx.try_recv().is_err());
}

#[test]
fn batch_flushes_previous_bucket_when_timestamp_changes() {
    let s = descriptor("line1_power", 101, "line1", None);
    let mut batch = Batch::default();

    assert!(batch.push(event(&s, 1.0, 100, 0)).is_none());
    assert!(batch.push(event(&s, 2.0, 100, 1)).is_none());
    assert_eq!(batch.len(), 2);

    let flushed = batch.push(event(&s, 3.0, 110, 2)).expect("bucket change flushes");
    assert_eq!(flushed.iter().map(|e| e.value).collect::<Vec<_>>(), vec![1.0, 2.0]);
    assert_eq!(batch.timestamp(), Some(110));
    assert_eq!(batch.len(), 1);

    let rest = batch.take();
    assert_eq!(rest.len(), 1);
    assert!(batch.is_empty());
    assert_eq!(batch.timestamp(), None);
}

#[test]
fn batch_to_points_tags_rounds_and_drops_incomplete_sensors() {
    let kitchen = descriptor("line1_power", 101, "line1", Some("kitchen"));
    let bare = descriptor("line2_power", 102, "line2", None);
    let mut broken = (*descriptor("mystery", 103, "", None)).clone();
    broken.device = String::new();
    let broken = Arc::new(broken);

    let points = batch_to_points(&[
        event(&kitchen, 230.46, 100, 0),
        event(&broken, 5.0, 100, 1),
        event(&bare, 12.04, 100, 2),
    ]);
    assert_eq!(points.len(), 2);

    assert_eq!(points[0].measurement, "power");
    assert_eq!(points[0].field, "sample");
    assert_eq!(points[0].value, 230.5);
    assert_eq!(points[0].tag_value("_device"), Some("line1"));
    assert_eq!(points[0].tag_value("_location"), Some("kitchen"));
    assert_eq!(
        points[0].to_line_protocol().unwrap(),
        "power,_device=line1,_location=kitchen sample=230.5 100"
    );

    assert_eq!(points[1].value, 12.0);
    assert_eq!(
        points[1].to_line_protocol().unwrap(),
        "power,_device=line2 sample=12 100"
    );
}

fn spawn_writer(store: Arc<MemoryStore>) -> (
    mpsc::UnboundedSender<energy_collector::models::SensorEvent>,
    Arc<WriterStats>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(WriterStats::default());
    let handle = spawn_batch_writer(
        rx,
        store,
        Arc::new(AtomicU64::new(0)),
        stats.clone(),
        BatchWriterConfig {
            stats_log_interval_secs: 300,
        },
    );
    (tx, stats, handle)
}

#[tokio::test]
async fn writer_emits_one_write_per_bucket_in_arrival_order() {
    let store = Arc::new(MemoryStore::default());
    let (tx, stats, handle) = spawn_writer(store.clone());
    let a = descriptor("line1_power", 101, "line1", None);
    let b = descriptor("line2_power", 102, "line2", None);

    tx.send(event(&a, 1.0, 100, 0)).unwrap();
    tx.send(event(&b, 2.0, 100, 1)).unwrap();
    tx.send(event(&a, 3.0, 100, 2)).unwrap();
    tx.send(event(&b, 4.0, 110, 3)).unwrap();
    tx.send(event(&a, 5.0, 110, 4)).unwrap();
    drop(tx);
    handle.await.unwrap();

    let writes = store.writes.lock().unwrap().clone();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].iter().map(|p| p.value).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
    assert!(writes[0].iter().all(|p| p.timestamp == 100));
    assert_eq!(writes[1].iter().map(|p| p.value).collect::<Vec<_>>(), vec![4.0, 5.0]);
    assert!(writes[1].iter().all(|p| p.timestamp == 110));
    assert_eq!(stats.points_written.load(Ordering::Relaxed), 5);
    assert_eq!(stats.batches_written.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn writer_drops_rejected_batch_and_keeps_going() {
    let store = Arc::new(MemoryStore::default());
    store.fail_next_write(StoreError::Rejected {
        status: 400,
        message: "unable to parse".into(),
    });
    store.fail_next_write(StoreError::Transport("connection reset".into()));
    let (tx, stats, handle) = spawn_writer(store.clone());
    let a = descriptor("line1_power", 101, "line1", None);

    tx.send(event(&a, 1.0, 100, 0)).unwrap();
    tx.send(event(&a, 2.0, 110, 1)).unwrap();
    tx.send(event(&a, 3.0, 120, 2)).unwrap();
    drop(tx);
    handle.await.unwrap();

    let writes = store.writes.lock().unwrap().clone();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0][0].value, 3.0);
    assert_eq!(stats.batches_dropped.load(Ordering::Relaxed), 2);
    assert_eq!(stats.points_written.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn writer_flushes_partial_bucket_when_queue_closes() {
    let store = Arc::new(MemoryStore::default());
    let (tx, _stats, handle) = spawn_writer(store.clone());
    let a = descriptor("line1_power", 101, "line1", None);

    tx.send(event(&a, 7.0, 100, 0)).unwrap();
    tokio::task::yield_now().await;
    assert!(store.writes.lock().unwrap().is_empty());

    drop(tx);
    handle.await.unwrap();
    assert_eq!(store.written_points().len(), 1);
}
