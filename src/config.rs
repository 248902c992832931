use serde::Deserialize;

use crate::models::{Period, RetentionRule, Schedule, validate_identifier};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub hub: HubConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub meter: Option<MeterConfig>,
    #[serde(default)]
    pub backfill: Option<BackfillConfig>,
    #[serde(default)]
    pub retention: Vec<RetentionRule>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Node name; the hub publishes states under `<node>/sensor/<object_id>/state`.
    pub node: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// How long to collect retained discovery messages after connecting.
    #[serde(default = "default_discovery_window_secs")]
    pub discovery_window_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "energy-collector".into()
}

fn default_discovery_prefix() -> String {
    "homeassistant".into()
}

fn default_discovery_window_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// Delete every job under `collector.base_name` before the first refresh.
    #[serde(default)]
    pub recreate_jobs: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Namespace prefix of every job this collector installs.
    #[serde(default = "default_base_name")]
    pub base_name: String,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    /// Samples arriving within one bucket are written together.
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: u64,
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
    /// Delay before exiting after a watchdog timeout, so a supervisor restarts us cleanly.
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_name: default_base_name(),
            watchdog_secs: default_watchdog_secs(),
            bucket_secs: default_bucket_secs(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
            restart_delay_secs: default_restart_delay_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_base_name() -> String {
    "energy".into()
}

fn default_watchdog_secs() -> u64 {
    60
}

fn default_bucket_secs() -> u64 {
    10
}

fn default_stats_log_interval_secs() -> u64 {
    300
}

fn default_restart_delay_secs() -> u64 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub integrations: WindowSampling,
    #[serde(default)]
    pub locations: WindowSampling,
}

/// Store execution interval (seconds) per aggregation window.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowSampling {
    #[serde(default = "default_sampling_today")]
    pub today: u64,
    #[serde(default = "default_sampling_month")]
    pub month: u64,
    #[serde(default = "default_sampling_year")]
    pub year: u64,
}

impl Default for WindowSampling {
    fn default() -> Self {
        Self {
            today: default_sampling_today(),
            month: default_sampling_month(),
            year: default_sampling_year(),
        }
    }
}

impl WindowSampling {
    /// `now` jobs run at the `today` cadence.
    pub fn for_period(&self, period: Period) -> u64 {
        match period {
            Period::Now | Period::Today => self.today,
            Period::Month => self.month,
            Period::Year => self.year,
        }
    }
}

fn default_sampling_today() -> u64 {
    30
}

fn default_sampling_month() -> u64 {
    300
}

fn default_sampling_year() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    /// Bucket holding solar production totals.
    pub production_bucket: String,
    #[serde(default = "default_production_measurement")]
    pub production_measurement: String,
    /// `(tag, value)` selecting the site-wide production series.
    #[serde(default = "default_production_tag")]
    pub production_tag: (String, String),
    /// Device whose energy totals represent whole-house consumption.
    #[serde(default = "default_consumption_device")]
    pub consumption_device: String,
    #[serde(default = "default_delta_sampling_secs")]
    pub delta_sampling_secs: u64,
    #[serde(default = "default_snapshot_cron")]
    pub snapshot_cron: String,
    /// Opening balance (kWh) written at today's midnight on startup.
    pub initial_reading: Option<f64>,
}

fn default_production_measurement() -> String {
    "production".into()
}

fn default_production_tag() -> (String, String) {
    ("_inverter".into(), "site".into())
}

fn default_consumption_device() -> String {
    "line".into()
}

fn default_delta_sampling_secs() -> u64 {
    150
}

fn default_snapshot_cron() -> String {
    "59 23 * * *".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_consumption_device")]
    pub device: String,
    #[serde(default = "default_backfill_months")]
    pub months: u32,
}

fn default_backfill_months() -> u32 {
    13
}

/// One configured sensor; matched to a hub entity by `name`.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub measurement: String,
    #[serde(default)]
    pub device: String,
    pub location: Option<String>,
    #[serde(default)]
    pub integrate: bool,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

fn default_enable() -> bool {
    true
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path, e))?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.hub.host.is_empty(), "hub.host must be non-empty");
        anyhow::ensure!(
            self.hub.port > 0,
            "hub.port must be between 1 and 65535, got {}",
            self.hub.port
        );
        anyhow::ensure!(!self.hub.node.is_empty(), "hub.node must be non-empty");
        anyhow::ensure!(
            !self.hub.node.contains(['/', '+', '#']),
            "hub.node must not contain MQTT wildcards or '/', got {:?}",
            self.hub.node
        );
        anyhow::ensure!(
            self.hub.discovery_window_secs > 0,
            "hub.discovery_window_secs must be > 0, got {}",
            self.hub.discovery_window_secs
        );
        anyhow::ensure!(
            self.store.url.starts_with("http://") || self.store.url.starts_with("https://"),
            "store.url must be an http(s) URL, got {:?}",
            self.store.url
        );
        anyhow::ensure!(!self.store.token.is_empty(), "store.token must be non-empty");
        anyhow::ensure!(!self.store.org.is_empty(), "store.org must be non-empty");
        anyhow::ensure!(
            !self.store.bucket.is_empty(),
            "store.bucket must be non-empty"
        );
        anyhow::ensure!(
            self.store.request_timeout_secs > 0,
            "store.request_timeout_secs must be > 0, got {}",
            self.store.request_timeout_secs
        );
        anyhow::ensure!(
            validate_identifier("collector.base_name", &self.collector.base_name).is_ok(),
            "collector.base_name must be an identifier ([A-Za-z0-9_-], no leading '_'), got {:?}",
            self.collector.base_name
        );
        anyhow::ensure!(
            self.collector.watchdog_secs > 0,
            "collector.watchdog_secs must be > 0, got {}",
            self.collector.watchdog_secs
        );
        anyhow::ensure!(
            self.collector.bucket_secs > 0,
            "collector.bucket_secs must be > 0, got {}",
            self.collector.bucket_secs
        );
        anyhow::ensure!(
            self.collector.stats_log_interval_secs > 0,
            "collector.stats_log_interval_secs must be > 0, got {}",
            self.collector.stats_log_interval_secs
        );
        for (name, w) in [
            ("sampling.integrations", &self.sampling.integrations),
            ("sampling.locations", &self.sampling.locations),
        ] {
            anyhow::ensure!(
                w.today > 0 && w.month > 0 && w.year > 0,
                "{} intervals must be > 0, got {}/{}/{}",
                name,
                w.today,
                w.month,
                w.year
            );
        }
        if let Some(meter) = &self.meter {
            anyhow::ensure!(
                !meter.production_bucket.is_empty(),
                "meter.production_bucket must be non-empty"
            );
            anyhow::ensure!(
                meter.delta_sampling_secs > 0,
                "meter.delta_sampling_secs must be > 0, got {}",
                meter.delta_sampling_secs
            );
            anyhow::ensure!(
                Schedule::cron(&meter.snapshot_cron).is_ok(),
                "meter.snapshot_cron must be a five-field cron expression, got {:?}",
                meter.snapshot_cron
            );
        }
        if let Some(backfill) = &self.backfill {
            anyhow::ensure!(
                backfill.months > 0,
                "backfill.months must be > 0, got {}",
                backfill.months
            );
        }
        for rule in &self.retention {
            anyhow::ensure!(!rule.name.is_empty(), "retention.name must be non-empty");
            anyhow::ensure!(
                !rule.predicate.is_empty(),
                "retention '{}': predicate must be non-empty",
                rule.name
            );
            anyhow::ensure!(
                rule.keep_last > 0,
                "retention '{}': keep_last must be > 0, got {}",
                rule.name,
                rule.keep_last
            );
        }
        for sensor in &self.sensors {
            anyhow::ensure!(!sensor.name.is_empty(), "sensors.name must be non-empty");
        }
        Ok(())
    }
}
