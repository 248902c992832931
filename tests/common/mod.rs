// Shared test helpers: in-memory store, scripted hub and sensor builders.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use energy_collector::config::SensorConfig;
use energy_collector::error::{HubError, StoreError};
use energy_collector::hub_repo::HubClient;
use energy_collector::models::*;
use energy_collector::store_repo::StoreClient;
use energy_collector::worker::SampleProducer;

pub const VALID_CONFIG: &str = r#"
[hub]
host = "192.168.1.40"
node = "cs24"

[store]
url = "http://localhost:8086"
token = "secret-token"
org = "home"
bucket = "cs24"

[collector]
base_name = "energy"
watchdog_secs = 60

[meter]
production_bucket = "multisma2"

[[retention]]
name = "raw power"
predicate = "_measurement=\"power\""
keep_last = 30

[[sensors]]
name = "cs24_line1_power"
measurement = "power"
device = "line1"
location = "kitchen"
integrate = true
"#;

pub const ORG: &str = "home";
pub const BUCKET: &str = "cs24";

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCall {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub predicate: String,
}

/// `StoreClient` backed by vectors. Job lookups are exact-name, like the real store.
pub struct MemoryStore {
    bucket: String,
    pub bucket_present: AtomicBool,
    pub writes: Mutex<Vec<Vec<Point>>>,
    pub jobs: Mutex<Vec<Job>>,
    pub created: Mutex<Vec<JobSpec>>,
    pub deleted_jobs: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<DeleteCall>>,
    pub queries: Mutex<Vec<String>>,
    /// `(needle, rows)`: the first needle contained in a query answers it.
    responses: Mutex<Vec<(String, Vec<QueryRow>)>>,
    write_failures: Mutex<VecDeque<StoreError>>,
    delete_failures: Mutex<VecDeque<StoreError>>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(BUCKET)
    }
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            bucket_present: AtomicBool::new(true),
            writes: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            deleted_jobs: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            write_failures: Mutex::new(VecDeque::new()),
            delete_failures: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn respond(&self, needle: &str, rows: Vec<QueryRow>) {
        self.responses
            .lock()
            .unwrap()
            .push((needle.to_string(), rows));
    }

    pub fn fail_next_write(&self, e: StoreError) {
        self.write_failures.lock().unwrap().push_back(e);
    }

    pub fn fail_next_delete(&self, e: StoreError) {
        self.delete_failures.lock().unwrap().push_back(e);
    }

    /// Installs a job as if someone else had created it.
    pub fn seed_job(&self, name: &str) -> String {
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.jobs.lock().unwrap().push(Job {
            id: id.clone(),
            name: name.to_string(),
            status: Some("active".into()),
        });
        id
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.lock().unwrap().iter().map(|j| j.name.clone()).collect();
        names.sort();
        names
    }

    pub fn written_points(&self) -> Vec<Point> {
        self.writes.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn write(&self, points: &[Point]) -> Result<(), StoreError> {
        if let Some(e) = self.write_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.writes.lock().unwrap().push(points.to_vec());
        Ok(())
    }

    async fn query(&self, query: &str) -> Result<Vec<QueryRow>, StoreError> {
        self.queries.lock().unwrap().push(query.to_string());
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(needle, _)| query.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn find_jobs(&self, name: Option<&str>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .iter()
            .filter(|j| name.is_none_or(|n| j.name == n))
            .cloned()
            .collect())
    }

    async fn create_job(&self, _org: &Organization, spec: &JobSpec) -> Result<Job, StoreError> {
        let job = Job {
            id: format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            name: spec.name.clone(),
            status: Some("active".into()),
        };
        self.jobs.lock().unwrap().push(job.clone());
        self.created.lock().unwrap().push(spec.clone());
        Ok(job)
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(pos) = jobs.iter().position(|j| j.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let job = jobs.remove(pos);
        self.deleted_jobs.lock().unwrap().push(job.name);
        Ok(())
    }

    async fn find_organizations(&self, name: &str) -> Result<Vec<Organization>, StoreError> {
        Ok(vec![Organization {
            id: "org-1".into(),
            name: ORG.into(),
        }]
        .into_iter()
        .filter(|o| o.name == name)
        .collect())
    }

    async fn delete_range(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &str,
    ) -> Result<(), StoreError> {
        if let Some(e) = self.delete_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.deletes.lock().unwrap().push(DeleteCall {
            start,
            stop,
            predicate: predicate.to_string(),
        });
        Ok(())
    }

    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        Ok(self.bucket_present.load(Ordering::Relaxed))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// `HubClient` with a fixed entity list; tests push samples through `emit`.
pub struct FakeHub {
    identity: DeviceIdentity,
    entities: Vec<HubEntity>,
    producer: Mutex<Option<SampleProducer>>,
    pub connect_fails: AtomicBool,
    pub disconnected: AtomicBool,
}

impl FakeHub {
    pub fn new(name: &str, entities: Vec<HubEntity>) -> Self {
        Self {
            identity: DeviceIdentity {
                name: name.to_string(),
                model: Some("CircuitSetup 6C".into()),
                version: Some("2024.6.1".into()),
            },
            entities,
            producer: Mutex::new(None),
            connect_fails: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Pushes one sample; false when nothing is subscribed or the sample was not enqueued.
    pub fn emit(&self, key: u32, value: f64) -> bool {
        let producer = self.producer.lock().unwrap().clone();
        producer.is_some_and(|p| p.on_sample(key, value))
    }

    pub fn is_subscribed(&self) -> bool {
        self.producer.lock().unwrap().is_some()
    }
}

#[async_trait]
impl HubClient for FakeHub {
    async fn connect(&self) -> Result<DeviceIdentity, HubError> {
        if self.connect_fails.load(Ordering::Relaxed) {
            return Err(HubError::Connect("connection refused".into()));
        }
        Ok(self.identity.clone())
    }

    async fn list_entities(&self) -> Result<Vec<HubEntity>, HubError> {
        Ok(self.entities.clone())
    }

    async fn subscribe(&self, producer: SampleProducer) -> Result<(), HubError> {
        *self.producer.lock().unwrap() = Some(producer);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HubError> {
        self.producer.lock().unwrap().take();
        self.disconnected.store(true, Ordering::Relaxed);
        Ok(())
    }
}

pub fn entity(name: &str, key: u32, precision: Option<u32>) -> HubEntity {
    HubEntity {
        name: name.to_string(),
        key,
        unit: Some("W".into()),
        precision,
    }
}

pub fn sensor_config(name: &str, device: &str, location: Option<&str>, integrate: bool) -> SensorConfig {
    SensorConfig {
        name: name.to_string(),
        display_name: None,
        measurement: "power".to_string(),
        device: device.to_string(),
        location: location.map(str::to_string),
        integrate,
        enable: true,
    }
}

pub fn descriptor(name: &str, key: u32, device: &str, location: Option<&str>) -> Arc<SensorDescriptor> {
    Arc::new(SensorDescriptor {
        name: name.to_string(),
        display_name: None,
        unit: Some("W".into()),
        key,
        precision: Some(1),
        measurement: "power".to_string(),
        device: device.to_string(),
        location: location.map(str::to_string),
        integrate: true,
    })
}

pub fn event(sensor: &Arc<SensorDescriptor>, value: f64, timestamp: i64, arrival_order: u64) -> SensorEvent {
    SensorEvent {
        sensor: sensor.clone(),
        value,
        timestamp,
        arrival_order,
    }
}

pub fn row(pairs: &[(&str, &str)]) -> QueryRow {
    pairs.iter().map(|(k, v)| (*k, *v)).collect()
}
