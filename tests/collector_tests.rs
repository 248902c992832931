// Collector orchestration: startup checks, watchdog exit and signal shutdown

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeHub, MemoryStore, VALID_CONFIG, entity};
use energy_collector::collector::Collector;
use energy_collector::config::AppConfig;
use energy_collector::error::CollectorError;
use energy_collector::hub_repo::discovery::entity_key;

fn config() -> AppConfig {
    AppConfig::load_from_str(VALID_CONFIG).unwrap()
}

fn hub() -> Arc<FakeHub> {
    Arc::new(FakeHub::new(
        "cs24",
        vec![entity("cs24_line1_power", entity_key("line1_power"), Some(1))],
    ))
}

#[tokio::test]
async fn start_fails_when_bucket_is_missing() {
    let store = Arc::new(MemoryStore::default());
    store.bucket_present.store(false, Ordering::Relaxed);
    let err = Collector::start(config(), store, hub()).await.err().unwrap();
    assert!(matches!(err, CollectorError::FailedInitialization(ref m) if m.contains("cs24")));
}

#[tokio::test]
async fn start_fails_when_organization_is_unknown() {
    let cfg = VALID_CONFIG.replace("org = \"home\"", "org = \"elsewhere\"");
    let config = AppConfig::load_from_str(&cfg).unwrap();
    let err = Collector::start(config, Arc::new(MemoryStore::default()), hub())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CollectorError::FailedInitialization(ref m) if m.contains("organization")));
}

#[tokio::test]
async fn start_fails_when_hub_is_unreachable() {
    let hub = hub();
    hub.connect_fails.store(true, Ordering::Relaxed);
    let err = Collector::start(config(), Arc::new(MemoryStore::default()), hub)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CollectorError::FailedInitialization(ref m) if m.contains("hub connect")));
}

#[tokio::test]
async fn start_fails_when_no_sensor_matches() {
    let hub = Arc::new(FakeHub::new("cs24", vec![entity("something_else", 7, None)]));
    let err = Collector::start(config(), Arc::new(MemoryStore::default()), hub)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CollectorError::FailedInitialization(_)));
}

#[tokio::test]
async fn start_runs_optional_one_shot_steps() {
    let cfg = VALID_CONFIG
        .replace("org = \"home\"", "org = \"home\"\nrecreate_jobs = true")
        .replace(
            "production_bucket = \"multisma2\"",
            "production_bucket = \"multisma2\"\ninitial_reading = 48213.0",
        );
    let config = AppConfig::load_from_str(&cfg).unwrap();
    let store = Arc::new(MemoryStore::default());
    store.seed_job("energy._device.old.today");
    store.seed_job("someone.else.today");

    let collector = Collector::start(config, store.clone(), hub()).await.unwrap();
    assert_eq!(collector.catalog().by_key.len(), 1);
    assert_eq!(store.job_names(), vec!["someone.else.today".to_string()]);
    let points = store.written_points();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, 48213.0);
}

#[tokio::test(start_paused = true)]
async fn silent_hub_ends_run_with_watchdog_timeout() {
    let store = Arc::new(MemoryStore::default());
    let hub = hub();
    let collector = Collector::start(config(), store.clone(), hub.clone()).await.unwrap();

    let result = collector.run(std::future::pending()).await;
    assert!(matches!(result, Err(CollectorError::WatchdogTimeout(ref name)) if name == "cs24"));
    assert!(hub.disconnected.load(Ordering::Relaxed));
    assert!(!hub.is_subscribed());
    // Startup refresh installed the jobs.
    assert!(store.job_names().contains(&"energy._power.kitchen.now".to_string()));
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_samples() {
    let store = Arc::new(MemoryStore::default());
    let hub = hub();
    let collector = Collector::start(config(), store.clone(), hub.clone()).await.unwrap();
    let stats = collector.stats();
    let counter = collector.context().events_received();

    let feeder = hub.clone();
    let shutdown = async move {
        assert!(feeder.emit(entity_key("line1_power"), 230.46));
        assert!(!feeder.emit(12345, 1.0));
        tokio::time::sleep(Duration::from_secs(5)).await;
    };
    collector.run(shutdown).await.unwrap();

    assert_eq!(counter.load(Ordering::Relaxed), 2);
    let samples: Vec<_> = store
        .written_points()
        .into_iter()
        .filter(|p| p.field == "sample")
        .collect();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 230.5);
    assert_eq!(samples[0].tag_value("_location"), Some("kitchen"));
    assert_eq!(stats.points_written.load(Ordering::Relaxed), 1);
}
