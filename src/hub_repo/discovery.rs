// Topic routing and discovery payloads published by the hub over MQTT.
//
// Discovery: `<prefix>/sensor/<node>/<object_id>/config` (retained JSON, long or abbreviated keys).
// State:     `<node>/sensor/<object_id>/state` (plain-text number).

use serde::Deserialize;

use crate::models::{DeviceIdentity, HubEntity};

/// Entity key the hub assigns: 32-bit FNV-1 of the object id.
pub fn entity_key(object_id: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for b in object_id.bytes() {
        hash = hash.wrapping_mul(16_777_619);
        hash ^= b as u32;
    }
    hash
}

#[derive(Debug, Clone, PartialEq)]
pub enum Topic<'a> {
    Discovery { object_id: &'a str },
    State { object_id: &'a str },
    Other,
}

pub fn classify<'a>(discovery_prefix: &str, node: &str, topic: &'a str) -> Topic<'a> {
    let parts: Vec<&'a str> = topic.split('/').collect();
    match parts.as_slice() {
        [prefix, "sensor", n, object_id, "config"] if *prefix == discovery_prefix && *n == node => {
            Topic::Discovery { object_id }
        }
        [n, "sensor", object_id, "state"] if *n == node => Topic::State { object_id },
        _ => Topic::Other,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryDevice {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "mdl")]
    pub model: Option<String>,
    #[serde(default, alias = "sw")]
    pub sw_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    pub name: String,
    #[serde(default, alias = "unit_of_meas")]
    pub unit_of_measurement: Option<String>,
    #[serde(default, alias = "sug_dsp_prc")]
    pub suggested_display_precision: Option<u32>,
    #[serde(default, alias = "dev")]
    pub device: Option<DiscoveryDevice>,
}

impl DiscoveryConfig {
    pub fn entity(&self, object_id: &str) -> HubEntity {
        HubEntity {
            name: self.name.clone(),
            key: entity_key(object_id),
            unit: self.unit_of_measurement.clone(),
            precision: self.suggested_display_precision,
        }
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        let dev = self.device.as_ref()?;
        Some(DeviceIdentity {
            name: dev.name.clone()?,
            model: dev.model.clone(),
            version: dev.sw_version.clone(),
        })
    }
}

/// An empty retained payload means "entity removed".
pub fn parse_discovery(payload: &[u8]) -> Option<DiscoveryConfig> {
    if payload.is_empty() {
        return None;
    }
    serde_json::from_slice(payload).ok()
}

/// `None` for payloads that are not numbers; "nan" parses to a non-finite value.
pub fn parse_state(payload: &[u8]) -> Option<f64> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}
