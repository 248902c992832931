// Job definitions per family. Every identifier goes through `JobKey::new` or
// `validate_identifier`, and every literal through `flux_string`, before it reaches a script.

use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::config::{MeterConfig, SamplingConfig};
use crate::error::JobError;
use crate::models::{Family, JobKey, JobSpec, Period, Schedule, SensorDescriptor, flux_string, validate_identifier};
use crate::scheduler::local_midnight;
use crate::worker::SAMPLE_FIELD;

/// Measurement every derived energy total is written to.
pub const ENERGY_MEASUREMENT: &str = "energy";
/// Meter tag values and fields used by the meter family and reconciliation.
pub const METER_TAG: &str = "_meter";
pub const METER_READING: &str = "reading";
pub const METER_DELTA: &str = "delta_wh";
pub const METER_CLOSING_FIELD: &str = "closing";

/// Everything a builder needs besides the family's own subject.
#[derive(Debug, Clone)]
pub struct JobEnv<'a> {
    pub base: &'a str,
    pub bucket: &'a str,
    pub org: &'a str,
    /// Local date the absolute window starts are computed from.
    pub today: NaiveDate,
    pub sampling: &'a SamplingConfig,
}

impl JobEnv<'_> {
    fn window_start(&self, period: Period) -> DateTime<Utc> {
        local_midnight(period.window_start(self.today)).with_timezone(&Utc)
    }
}

/// `r.col` for plain columns, `r["col"]` otherwise.
fn column(col: &str) -> String {
    if col.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && !col.is_empty() {
        format!("r.{col}")
    } else {
        format!("r[{}]", flux_string(col))
    }
}

fn eq(col: &str, value: &str) -> String {
    format!("{} == {}", column(col), flux_string(value))
}

/// A linear `from |> ... |> to` script.
#[derive(Debug, Clone)]
struct Pipeline {
    script: String,
}

impl Pipeline {
    fn from(bucket: &str) -> Self {
        Self {
            script: format!("from(bucket: {})", flux_string(bucket)),
        }
    }

    fn assign(name: &str, bucket: &str) -> Self {
        Self {
            script: format!("{name} = from(bucket: {})", flux_string(bucket)),
        }
    }

    fn stage(mut self, stage: impl AsRef<str>) -> Self {
        let _ = write!(self.script, "\n  |> {}", stage.as_ref());
        self
    }

    fn range_at(self, start: DateTime<Utc>) -> Self {
        let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.stage(format!("range(start: {start})"))
    }

    fn range_rel(self, start: &str) -> Self {
        self.stage(format!("range(start: {start})"))
    }

    fn filter(self, conditions: &[String]) -> Self {
        self.stage(format!("filter(fn: (r) => {})", conditions.join(" and ")))
    }

    /// Record constructor; `fields` are `(column, expression)` pairs.
    fn map(self, fields: &[(&str, String)]) -> Self {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.stage(format!("map(fn: (r) => ({{{body}}}))"))
    }

    fn to(self, bucket: &str, org: &str) -> Self {
        self.stage(format!(
            "to(bucket: {}, org: {})",
            flux_string(bucket),
            flux_string(org)
        ))
    }

    fn build(self) -> String {
        let mut script = self.script;
        script.push('\n');
        script
    }
}

fn spec(env: &JobEnv<'_>, key: JobKey, script: String, schedule: Schedule) -> JobSpec {
    JobSpec {
        name: key.name(env.base),
        key,
        script,
        schedule,
    }
}

/// Device energy for one window: integrates raw samples (today) or sums the finer window.
pub fn device_job(env: &JobEnv<'_>, sensor: &SensorDescriptor, period: Period) -> Result<JobSpec, JobError> {
    if period == Period::Now {
        return Err(JobError::InvalidSchedule("device jobs have no 'now' window".into()));
    }
    validate_identifier("measurement", &sensor.measurement)?;
    let location = sensor.location();
    let key = match location {
        Some(location) => JobKey::new(Family::Device, &[sensor.device.as_str(), location], period)?,
        None => JobKey::new(Family::Device, &[sensor.device.as_str()], period)?,
    };

    let mut pipeline = Pipeline::from(env.bucket).range_at(env.window_start(period));
    pipeline = match period.summed_from() {
        None => pipeline
            .filter(&[
                eq("_measurement", &sensor.measurement),
                eq("_device", &sensor.device),
                eq("_field", SAMPLE_FIELD),
            ]),
        Some(finer) => pipeline.filter(&[
            eq("_measurement", ENERGY_MEASUREMENT),
            eq("_device", &sensor.device),
            eq("_field", finer.as_str()),
        ]),
    };
    // Without a location, series of the same device tagged with one are someone else's.
    pipeline = match location {
        Some(location) => pipeline.filter(&[eq("_location", location)]),
        None => pipeline.filter(&["not exists r._location".to_string()]),
    };
    pipeline = match period.summed_from() {
        None => pipeline.stage("integral(unit: 1h, column: \"_value\")"),
        Some(_) => pipeline.stage("sum(column: \"_value\")"),
    };
    let mut fields = vec![
        ("_time", "r._start".to_string()),
        ("_measurement", flux_string(ENERGY_MEASUREMENT)),
        ("_device", "r._device".to_string()),
    ];
    if location.is_some() {
        fields.push(("_location", "r._location".to_string()));
    }
    fields.push(("_field", flux_string(period.as_str())));
    fields.push(("_value", "r._value".to_string()));
    let script = pipeline.map(&fields).to(env.bucket, env.org).build();

    let schedule = Schedule::every(env.sampling.integrations.for_period(period))?;
    Ok(spec(env, key, script, schedule))
}

/// Location energy for one window: sum of the latest member-device totals.
pub fn location_energy_job(env: &JobEnv<'_>, location: &str, period: Period) -> Result<JobSpec, JobError> {
    if period == Period::Now {
        return Err(JobError::InvalidSchedule("location energy has no 'now' window".into()));
    }
    let key = JobKey::new(Family::Location, &[location], period)?;
    let script = Pipeline::from(env.bucket)
        .range_at(env.window_start(period))
        .filter(&[
            eq("_measurement", ENERGY_MEASUREMENT),
            eq("_location", location),
            eq("_field", period.as_str()),
            "exists r._device".to_string(),
        ])
        .stage("last()")
        .stage("drop(columns: [\"_device\"])")
        .stage("sum(column: \"_value\")")
        .map(&[
            ("_time", "r._start".to_string()),
            ("_measurement", flux_string(ENERGY_MEASUREMENT)),
            ("_location", "r._location".to_string()),
            ("_field", flux_string(period.as_str())),
            ("_value", "r._value".to_string()),
        ])
        .to(env.bucket, env.org)
        .build();
    let schedule = Schedule::every(env.sampling.locations.for_period(period))?;
    Ok(spec(env, key, script, schedule))
}

/// Instantaneous location power: sum of each member's latest sample, under the group's
/// measurement, field `now`.
pub fn power_now_job(env: &JobEnv<'_>, location: &str, measurement: &str) -> Result<JobSpec, JobError> {
    validate_identifier("measurement", measurement)?;
    let key = JobKey::new(Family::Power, &[location], Period::Now)?;
    let script = Pipeline::from(env.bucket)
        .range_at(env.window_start(Period::Now))
        .filter(&[
            eq("_measurement", measurement),
            eq("_location", location),
            eq("_field", SAMPLE_FIELD),
        ])
        .stage("last()")
        .stage("drop(columns: [\"_device\"])")
        .stage("sum(column: \"_value\")")
        .map(&[
            ("_time", "r._start".to_string()),
            ("_measurement", flux_string(measurement)),
            ("_location", "r._location".to_string()),
            ("_field", flux_string(Period::Now.as_str())),
            ("_value", "r._value".to_string()),
        ])
        .to(env.bucket, env.org)
        .build();
    let schedule = Schedule::every(env.sampling.locations.for_period(Period::Now))?;
    Ok(spec(env, key, script, schedule))
}

/// Consumption minus production (Wh) over one window; production totals are kWh.
pub fn meter_delta_job(env: &JobEnv<'_>, meter: &MeterConfig, period: Period) -> Result<JobSpec, JobError> {
    if period == Period::Now {
        return Err(JobError::InvalidSchedule("meter delta has no 'now' window".into()));
    }
    let key = JobKey::new(Family::Meter, &[METER_DELTA], period)?;
    let (tag_key, tag_value) = &meter.production_tag;
    let range = period.relative_range();

    let production = Pipeline::assign("production", &meter.production_bucket)
        .range_rel(range)
        .filter(&[
            eq("_measurement", &meter.production_measurement),
            eq("_field", period.as_str()),
            eq(tag_key, tag_value),
        ])
        .map(&[
            ("_time", "r._time".to_string()),
            ("_measurement", flux_string(ENERGY_MEASUREMENT)),
            (METER_TAG, flux_string("production")),
            ("_field", "r._field".to_string()),
            ("_value", "r._value * 1000.0".to_string()),
        ])
        .build();
    let consumption = Pipeline::assign("consumption", env.bucket)
        .range_rel(range)
        .filter(&[
            eq("_measurement", ENERGY_MEASUREMENT),
            eq("_device", &meter.consumption_device),
            eq("_field", period.as_str()),
        ])
        .map(&[
            ("_time", "r._time".to_string()),
            ("_measurement", flux_string(ENERGY_MEASUREMENT)),
            (METER_TAG, flux_string("consumption")),
            ("_field", "r._field".to_string()),
            ("_value", "r._value".to_string()),
        ])
        .build();
    let mut script = format!("{production}\n{consumption}\nunion(tables: [production, consumption])");
    let tail = Pipeline { script: String::new() }
        .stage(format!(
            "pivot(rowKey: [\"_time\"], columnKey: [{}], valueColumn: \"_value\")",
            flux_string(METER_TAG)
        ))
        .filter(&[
            "exists r.production".to_string(),
            "exists r.consumption".to_string(),
        ])
        .map(&[
            ("_time", "r._time".to_string()),
            ("_measurement", flux_string(ENERGY_MEASUREMENT)),
            (METER_TAG, flux_string(METER_DELTA)),
            ("_field", flux_string(period.as_str())),
            ("_value", "r.consumption - r.production".to_string()),
        ])
        .to(env.bucket, env.org)
        .build();
    script.push_str(&tail);

    let schedule = Schedule::every(meter.delta_sampling_secs)?;
    Ok(spec(env, key, script, schedule))
}

/// Cron job freezing the day's final delta into field `closing` for nightly reconciliation.
pub fn meter_snapshot_job(env: &JobEnv<'_>, meter: &MeterConfig) -> Result<JobSpec, JobError> {
    let key = JobKey::new(Family::Meter, &["snapshot"], Period::Today)?;
    let script = Pipeline::from(env.bucket)
        .range_rel(Period::Today.relative_range())
        .filter(&[
            eq("_measurement", ENERGY_MEASUREMENT),
            eq(METER_TAG, METER_DELTA),
            eq("_field", Period::Today.as_str()),
        ])
        .stage("last()")
        .map(&[
            ("_time", "r._time".to_string()),
            ("_measurement", flux_string(ENERGY_MEASUREMENT)),
            (METER_TAG, flux_string(METER_DELTA)),
            ("_field", flux_string(METER_CLOSING_FIELD)),
            ("_value", "r._value".to_string()),
        ])
        .to(env.bucket, env.org)
        .build();
    let schedule = Schedule::cron(&meter.snapshot_cron)?;
    Ok(spec(env, key, script, schedule))
}
