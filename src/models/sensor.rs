use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One entity as reported live by the hub at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEntity {
    pub name: String,
    pub key: u32,
    pub unit: Option<String>,
    pub precision: Option<u32>,
}

/// What the hub says about itself after connecting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub model: Option<String>,
    pub version: Option<String>,
}

/// A configured sensor resolved against the hub's entity list. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub name: String,
    pub display_name: Option<String>,
    pub unit: Option<String>,
    pub key: u32,
    /// Decimal places kept when writing samples.
    pub precision: Option<u32>,
    pub measurement: String,
    pub device: String,
    pub location: Option<String>,
    /// Instantaneous reading that must be time-integrated into energy.
    pub integrate: bool,
}

impl SensorDescriptor {
    /// Location tag, treating an empty string as "no location".
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref().filter(|l| !l.is_empty())
    }

    /// Rounds `value` to the configured precision (no-op when precision is unknown).
    pub fn round(&self, value: f64) -> f64 {
        match self.precision {
            Some(p) => {
                let scale = 10f64.powi(p.min(15) as i32);
                (value * scale).round() / scale
            }
            None => value,
        }
    }
}

/// One raw sample on its way from the hub callback to the batcher.
#[derive(Debug, Clone)]
pub struct SensorEvent {
    pub sensor: Arc<SensorDescriptor>,
    pub value: f64,
    /// Bucket timestamp, unix seconds.
    pub timestamp: i64,
    pub arrival_order: u64,
}
