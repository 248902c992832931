// Orchestration: startup checks, then every component as its own task until shutdown or a
// watchdog timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backfill::run_backfill;
use crate::catalog::SensorCatalog;
use crate::config::AppConfig;
use crate::context::CollectorContext;
use crate::error::CollectorError;
use crate::hub_repo::HubClient;
use crate::meter::MeterReconciler;
use crate::models::{DeviceIdentity, Period};
use crate::retention_worker;
use crate::scheduler::{self, SchedulerDeps};
use crate::store_repo::StoreClient;
use crate::task_manager::TaskManager;
use crate::watchdog::Watchdog;
use crate::worker::{self, BatchWriterConfig, SampleProducer, WriterStats};

/// Retention triggers are daily; a small buffer is plenty.
const RETENTION_TRIGGER_CAPACITY: usize = 4;

/// A collector that passed its startup checks and is ready to run.
pub struct Collector {
    config: AppConfig,
    ctx: Arc<CollectorContext>,
    hub: Arc<dyn HubClient>,
    identity: DeviceIdentity,
    catalog: Arc<SensorCatalog>,
    task_manager: Arc<TaskManager>,
    meter: Option<Arc<MeterReconciler>>,
    stats: Arc<WriterStats>,
}

fn init_failed(what: &str, e: impl std::fmt::Display) -> CollectorError {
    CollectorError::FailedInitialization(format!("{what}: {e}"))
}

impl Collector {
    /// Verifies store access, connects to the hub and resolves the sensor catalog. Optional
    /// one-shot steps (job wipe, initial meter reading, backfill) log their failures.
    pub async fn start(
        config: AppConfig,
        store: Arc<dyn StoreClient>,
        hub: Arc<dyn HubClient>,
    ) -> Result<Self, CollectorError> {
        let ctx = Arc::new(CollectorContext::new(
            store.clone(),
            config.store.org.clone(),
            config.collector.base_name.clone(),
        ));

        match store.bucket_exists().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(CollectorError::FailedInitialization(format!(
                    "bucket '{}' does not exist",
                    store.bucket()
                )));
            }
            Err(e) => return Err(init_failed("store unreachable", e)),
        }
        let org = ctx
            .resolve_organization()
            .await
            .map_err(|e| init_failed("organization lookup", e))?;

        let identity = hub.connect().await.map_err(|e| init_failed("hub connect", e))?;
        let entities = hub
            .list_entities()
            .await
            .map_err(|e| init_failed("hub entity list", e))?;
        info!(
            hub = %identity.name,
            model = identity.model.as_deref().unwrap_or("unknown"),
            version = identity.version.as_deref().unwrap_or("unknown"),
            entities = entities.len(),
            "connected to hub"
        );

        let catalog = Arc::new(SensorCatalog::build(&config.sensors, &entities));
        if catalog.is_empty() {
            return Err(CollectorError::FailedInitialization(
                "no configured sensor matches a hub entity".into(),
            ));
        }
        info!(
            sensors = catalog.by_key.len(),
            locations = catalog.by_location.len(),
            integrations = catalog.by_integration.len(),
            organization = %org.name,
            bucket = %store.bucket(),
            "sensor catalog resolved"
        );

        let task_manager = Arc::new(TaskManager::new(
            ctx.clone(),
            catalog.clone(),
            config.sampling.clone(),
            config.meter.clone(),
        ));
        if config.store.recreate_jobs {
            match task_manager.delete_all().await {
                Ok(deleted) => info!(deleted, "existing jobs deleted (store.recreate_jobs)"),
                Err(e) => warn!(error = %e, operation = "delete_jobs", "could not delete existing jobs"),
            }
        }

        let today = Local::now().date_naive();
        let meter = config
            .meter
            .as_ref()
            .map(|_| Arc::new(MeterReconciler::new(ctx.clone())));
        if let (Some(meter), Some(reading)) = (
            &meter,
            config.meter.as_ref().and_then(|m| m.initial_reading),
        ) && let Err(e) = meter.set_reading(reading, today).await
        {
            warn!(error = %e, operation = "set_meter_reading", "initial meter reading not written");
        }

        if let Some(backfill) = config.backfill.as_ref().filter(|b| b.enabled)
            && let Err(e) = run_backfill(&ctx, backfill, today).await
        {
            warn!(error = %e, operation = "backfill", "backfill failed");
        }

        Ok(Self {
            config,
            ctx,
            hub,
            identity,
            catalog,
            task_manager,
            meter,
            stats: Arc::new(WriterStats::default()),
        })
    }

    pub fn context(&self) -> &Arc<CollectorContext> {
        &self.ctx
    }

    pub fn catalog(&self) -> &Arc<SensorCatalog> {
        &self.catalog
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    /// Runs until `shutdown` resolves (`Ok`) or the watchdog trips (`Err(WatchdogTimeout)`).
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), CollectorError> {
        let collector = &self.config.collector;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let producer = SampleProducer::new(
            event_tx,
            &self.catalog,
            self.ctx.events_received(),
            collector.bucket_secs,
        );

        let writer = worker::spawn_batch_writer(
            event_rx,
            self.ctx.store.clone(),
            self.ctx.events_received(),
            self.stats.clone(),
            BatchWriterConfig {
                stats_log_interval_secs: collector.stats_log_interval_secs,
            },
        );
        self.hub
            .subscribe(producer)
            .await
            .map_err(|e| init_failed("hub subscribe", e))?;

        let (retention_tx, retention_rx) = mpsc::channel::<Vec<Period>>(RETENTION_TRIGGER_CAPACITY);
        let mut handles: Vec<JoinHandle<()>> = vec![
            retention_worker::spawn(self.ctx.clone(), self.config.retention.clone(), retention_rx),
            scheduler::spawn(SchedulerDeps::new(
                self.task_manager.clone(),
                self.meter.clone(),
                retention_tx,
            )),
        ];

        let watchdog = Watchdog::new(
            self.ctx.events_received(),
            Duration::from_secs(collector.watchdog_secs),
            self.identity.name.clone(),
        );
        info!(
            watchdog_secs = collector.watchdog_secs,
            bucket_secs = collector.bucket_secs,
            "collector running"
        );
        let outcome = tokio::select! {
            timeout = watchdog.run() => Err(timeout),
            _ = shutdown => {
                info!("Received shutdown signal");
                Ok(())
            }
        };

        // Disconnecting drops the producer, which closes the queue and lets the writer flush.
        if let Err(e) = self.hub.disconnect().await {
            warn!(error = %e, operation = "hub_disconnect", "hub disconnect failed");
        }
        for handle in handles.drain(..) {
            handle.abort();
        }
        let grace = Duration::from_millis(collector.shutdown_grace_ms);
        if tokio::time::timeout(grace, writer).await.is_err() {
            warn!("batch writer did not finish within the shutdown grace period");
        }

        if let Err(e) = &outcome {
            error!(error = %e, events_received = self.ctx.events_received_total(), "collector stopped");
        }
        outcome
    }
}
