// Sensor catalog: configured sensors resolved against the hub's live entity list.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::SensorConfig;
use crate::models::{HubEntity, SensorDescriptor};

/// Lookup tables built once at startup and shared read-only by every component.
#[derive(Debug, Clone, Default)]
pub struct SensorCatalog {
    pub by_name: BTreeMap<String, Arc<SensorDescriptor>>,
    pub by_key: HashMap<u32, Arc<SensorDescriptor>>,
    /// Integratable sensors grouped by location; every group shares one measurement family.
    pub by_location: BTreeMap<String, Vec<Arc<SensorDescriptor>>>,
    /// Every integratable sensor, with or without a location.
    pub by_integration: Vec<Arc<SensorDescriptor>>,
}

impl SensorCatalog {
    pub fn build(config: &[SensorConfig], entities: &[HubEntity]) -> Self {
        let (by_name, by_key) = resolve(config, entities);
        let by_location = group_by_location(&by_name);
        let by_integration = integratable(&by_name);
        Self {
            by_name,
            by_key,
            by_location,
            by_integration,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Builds a descriptor for every enabled entry whose name the hub reports; others are skipped.
pub fn resolve(
    config: &[SensorConfig],
    entities: &[HubEntity],
) -> (
    BTreeMap<String, Arc<SensorDescriptor>>,
    HashMap<u32, Arc<SensorDescriptor>>,
) {
    let live: HashMap<&str, &HubEntity> = entities.iter().map(|e| (e.name.as_str(), e)).collect();
    let mut by_name = BTreeMap::new();
    let mut by_key = HashMap::new();

    for entry in config {
        if !entry.enable {
            debug!(sensor = %entry.name, "sensor disabled in configuration");
            continue;
        }
        let Some(entity) = live.get(entry.name.as_str()) else {
            warn!(sensor = %entry.name, "sensor not reported by hub; skipped");
            continue;
        };
        let descriptor = Arc::new(SensorDescriptor {
            name: entry.name.clone(),
            display_name: entry.display_name.clone(),
            unit: entity.unit.clone(),
            key: entity.key,
            precision: entity.precision,
            measurement: entry.measurement.clone(),
            device: entry.device.clone(),
            location: entry.location.clone().filter(|l| !l.is_empty()),
            integrate: entry.integrate,
        });
        by_name.insert(entry.name.clone(), descriptor.clone());
        by_key.insert(entity.key, descriptor);
    }
    (by_name, by_key)
}

/// Groups integratable sensors by location. A location mixing measurement families is a
/// configuration error: it is logged and that location is dropped.
pub fn group_by_location(
    by_name: &BTreeMap<String, Arc<SensorDescriptor>>,
) -> BTreeMap<String, Vec<Arc<SensorDescriptor>>> {
    let mut groups: BTreeMap<String, Vec<Arc<SensorDescriptor>>> = BTreeMap::new();
    for sensor in by_name.values() {
        if !sensor.integrate {
            continue;
        }
        if let Some(location) = sensor.location() {
            groups
                .entry(location.to_string())
                .or_default()
                .push(sensor.clone());
        }
    }
    groups.retain(|location, sensors| {
        let first = &sensors[0].measurement;
        let consistent = sensors.iter().all(|s| &s.measurement == first);
        if !consistent {
            error!(
                location = %location,
                "all sensors in a location must share one measurement; location dropped"
            );
        }
        consistent
    });
    groups
}

pub fn integratable(by_name: &BTreeMap<String, Arc<SensorDescriptor>>) -> Vec<Arc<SensorDescriptor>> {
    by_name.values().filter(|s| s.integrate).cloned().collect()
}
