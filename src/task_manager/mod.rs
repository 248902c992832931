// Aggregation task manager: keeps the store's jobs consistent with the sensor catalog and the
// calendar. The store runs the jobs; this module only installs and retires them.

pub mod flux;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, instrument, warn};

use crate::catalog::SensorCatalog;
use crate::config::{MeterConfig, SamplingConfig};
use crate::context::CollectorContext;
use crate::error::{JobError, StoreError};
use crate::models::{JobKey, JobSpec, Organization, Period};

use flux::JobEnv;

/// Outcome of one refresh; failures are per job and never abort the refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub deleted: usize,
    pub created: usize,
    pub existing: usize,
    pub failed: usize,
}

pub struct TaskManager {
    ctx: Arc<CollectorContext>,
    catalog: Arc<SensorCatalog>,
    sampling: SamplingConfig,
    meter: Option<MeterConfig>,
}

impl TaskManager {
    pub fn new(
        ctx: Arc<CollectorContext>,
        catalog: Arc<SensorCatalog>,
        sampling: SamplingConfig,
        meter: Option<MeterConfig>,
    ) -> Self {
        Self {
            ctx,
            catalog,
            sampling,
            meter,
        }
    }

    /// Every job definition for `periods`, keyed by name. Definitions that fail validation are
    /// logged and left out.
    pub fn job_specs(&self, periods: &[Period], today: NaiveDate) -> BTreeMap<String, JobSpec> {
        let env = JobEnv {
            base: &self.ctx.base_name,
            bucket: self.ctx.store.bucket(),
            org: &self.ctx.org_name,
            today,
            sampling: &self.sampling,
        };
        let mut built: Vec<Result<JobSpec, JobError>> = Vec::new();

        for &period in periods {
            if period == Period::Now {
                for (location, sensors) in &self.catalog.by_location {
                    if let Some(first) = sensors.first() {
                        built.push(flux::power_now_job(&env, location, &first.measurement));
                    }
                }
                continue;
            }
            for sensor in &self.catalog.by_integration {
                built.push(flux::device_job(&env, sensor, period));
            }
            for location in self.catalog.by_location.keys() {
                built.push(flux::location_energy_job(&env, location, period));
            }
            if let Some(meter) = &self.meter {
                built.push(flux::meter_delta_job(&env, meter, period));
                if period == Period::Today {
                    built.push(flux::meter_snapshot_job(&env, meter));
                }
            }
        }

        let mut specs = BTreeMap::new();
        for result in built {
            match result {
                Ok(spec) => {
                    if let Some(previous) = specs.insert(spec.name.clone(), spec) {
                        warn!(job = %previous.name, "two sensors map to the same job; keeping the last");
                    }
                }
                Err(e) => warn!(error = %e, operation = "build_job", "job definition skipped"),
            }
        }
        specs
    }

    /// Deletes this collector's jobs for `periods` (plus `now`), then installs every missing job.
    #[instrument(skip(self), fields(base = %self.ctx.base_name))]
    pub async fn refresh(&self, periods: &[Period], today: NaiveDate) -> Result<RefreshSummary, StoreError> {
        let mut targets: Vec<Period> = periods.to_vec();
        if !targets.contains(&Period::Now) {
            targets.push(Period::Now);
        }
        targets.sort();
        targets.dedup();

        let org = self.ctx.organization().await?;
        let mut summary = RefreshSummary {
            deleted: self.delete_for_periods(&targets).await?,
            ..RefreshSummary::default()
        };
        for spec in self.job_specs(&Period::ALL, today).values() {
            match self.ensure(&org, spec).await {
                Ok(true) => summary.created += 1,
                Ok(false) => summary.existing += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(error = %e, job = %spec.name, operation = "create_job", "job not installed");
                }
            }
        }
        info!(
            periods = ?targets,
            deleted = summary.deleted,
            created = summary.created,
            existing = summary.existing,
            failed = summary.failed,
            "aggregation jobs refreshed"
        );
        Ok(summary)
    }

    /// Creates `spec` unless a job with its exact name exists. Returns whether it was created.
    pub async fn ensure(&self, org: &Organization, spec: &JobSpec) -> Result<bool, StoreError> {
        let existing = self.ctx.store.find_jobs(Some(&spec.name)).await?;
        if !existing.is_empty() {
            debug!(job = %spec.name, "job already installed");
            return Ok(false);
        }
        self.ctx.store.create_job(org, spec).await?;
        debug!(job = %spec.name, schedule = ?spec.schedule, "job created");
        Ok(true)
    }

    /// Deletes jobs in this collector's namespace whose period is in `periods`.
    pub async fn delete_for_periods(&self, periods: &[Period]) -> Result<usize, StoreError> {
        self.delete_matching(|key| periods.contains(&key.period)).await
    }

    /// Deletes every job in this collector's namespace.
    pub async fn delete_all(&self) -> Result<usize, StoreError> {
        self.delete_matching(|_| true).await
    }

    async fn delete_matching(&self, matches: impl Fn(&JobKey) -> bool) -> Result<usize, StoreError> {
        let jobs = self.ctx.store.find_jobs(None).await?;
        let mut deleted = 0;
        for job in jobs {
            let Some(key) = JobKey::parse(&self.ctx.base_name, &job.name) else {
                continue;
            };
            if !matches(&key) {
                continue;
            }
            match self.ctx.store.delete_job(&job.id).await {
                Ok(()) => {
                    debug!(job = %job.name, "job deleted");
                    deleted += 1;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(error = %e, job = %job.name, operation = "delete_job", "job not deleted"),
            }
        }
        Ok(deleted)
    }
}
