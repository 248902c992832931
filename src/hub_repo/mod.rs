// Telemetry hub boundary: identity, entity list and a push subscription.

pub mod discovery;
mod mqtt;

pub use mqtt::MqttHub;

use async_trait::async_trait;

use crate::error::HubError;
use crate::models::{DeviceIdentity, HubEntity};
use crate::worker::SampleProducer;

#[async_trait]
pub trait HubClient: Send + Sync {
    async fn connect(&self) -> Result<DeviceIdentity, HubError>;

    async fn list_entities(&self) -> Result<Vec<HubEntity>, HubError>;

    /// Installs the producer; it is called once per pushed sample for the life of the connection.
    async fn subscribe(&self, producer: SampleProducer) -> Result<(), HubError>;

    async fn disconnect(&self) -> Result<(), HubError>;
}
