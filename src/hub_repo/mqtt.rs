// Hub client over MQTT (rumqttc). Entities come from retained discovery messages; samples
// from the per-entity state topics. A broken connection ends the event loop for good: the
// watchdog notices the silence and the process restarts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::HubClient;
use super::discovery::{Topic, classify, entity_key, parse_discovery, parse_state};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::models::{DeviceIdentity, HubEntity};
use crate::worker::SampleProducer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Default)]
struct HubShared {
    /// Keyed by object id.
    entities: RwLock<BTreeMap<String, HubEntity>>,
    identity: RwLock<Option<DeviceIdentity>>,
    producer: RwLock<Option<SampleProducer>>,
}

pub struct MqttHub {
    config: HubConfig,
    shared: Arc<HubShared>,
    client: Mutex<Option<AsyncClient>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            shared: Arc::new(HubShared::default()),
            client: Mutex::new(None),
            event_loop: Mutex::new(None),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = &self.config.username {
            options.set_credentials(username, self.config.password.clone().unwrap_or_default());
        }
        options
    }

    fn client(&self) -> Result<AsyncClient, HubError> {
        self.client
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(HubError::NotConnected)
    }
}

fn dispatch(shared: &HubShared, config: &HubConfig, topic: &str, payload: &[u8]) {
    match classify(&config.discovery_prefix, &config.node, topic) {
        Topic::Discovery { object_id } => {
            let Ok(mut entities) = shared.entities.write() else {
                return;
            };
            match parse_discovery(payload) {
                Some(discovered) => {
                    if let Some(identity) = discovered.identity()
                        && let Ok(mut slot) = shared.identity.write()
                    {
                        *slot = Some(identity);
                    }
                    tracing::debug!(object_id, name = %discovered.name, "entity discovered");
                    entities.insert(object_id.to_string(), discovered.entity(object_id));
                }
                None => {
                    entities.remove(object_id);
                }
            }
        }
        Topic::State { object_id } => {
            let producer = shared.producer.read().ok().and_then(|p| p.clone());
            if let Some(producer) = producer {
                // Unparsable payloads still count as hub activity.
                producer.on_sample(entity_key(object_id), parse_state(payload).unwrap_or(f64::NAN));
            }
        }
        Topic::Other => {}
    }
}

#[async_trait]
impl HubClient for MqttHub {
    async fn connect(&self) -> Result<DeviceIdentity, HubError> {
        let (client, mut event_loop) = AsyncClient::new(self.options(), 256);
        let discovery_filter = format!(
            "{}/sensor/{}/+/config",
            self.config.discovery_prefix, self.config.node
        );
        let state_filter = format!("{}/sensor/+/state", self.config.node);
        client.subscribe(&discovery_filter, QoS::AtMostOnce).await?;
        client.subscribe(&state_filter, QoS::AtMostOnce).await?;

        let (connected_tx, connected_rx) = oneshot::channel::<Result<(), String>>();
        let shared = self.shared.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let mut connected_tx = Some(connected_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Some(tx) = connected_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                        tracing::debug!(host = %config.host, "hub connection acknowledged");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(&shared, &config, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        match connected_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(e.to_string()));
                            }
                            None => tracing::error!(error = %e, "hub connection lost"),
                        }
                        break;
                    }
                }
            }
        });
        if let Ok(mut slot) = self.event_loop.lock()
            && let Some(previous) = slot.replace(handle)
        {
            previous.abort();
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(HubError::Connect(e)),
            Ok(Err(_)) => return Err(HubError::Connect("event loop ended".into())),
            Err(_) => {
                return Err(HubError::Connect(format!(
                    "no answer from {}:{} within {:?}",
                    self.config.host, self.config.port, CONNECT_TIMEOUT
                )));
            }
        }
        if let Ok(mut slot) = self.client.lock() {
            *slot = Some(client);
        }

        // Retained discovery messages arrive right after subscribing.
        tokio::time::sleep(Duration::from_secs(self.config.discovery_window_secs)).await;

        let identity = self
            .shared
            .identity
            .read()
            .ok()
            .and_then(|i| i.clone())
            .unwrap_or_else(|| DeviceIdentity {
                name: self.config.node.clone(),
                ..DeviceIdentity::default()
            });
        Ok(identity)
    }

    async fn list_entities(&self) -> Result<Vec<HubEntity>, HubError> {
        self.client()?;
        let entities = self
            .shared
            .entities
            .read()
            .map_err(|_| HubError::Protocol("entity table poisoned".into()))?;
        Ok(entities.values().cloned().collect())
    }

    async fn subscribe(&self, producer: SampleProducer) -> Result<(), HubError> {
        self.client()?;
        let mut slot = self
            .shared
            .producer
            .write()
            .map_err(|_| HubError::Protocol("producer slot poisoned".into()))?;
        *slot = Some(producer);
        Ok(())
    }

    /// Releases the producer and stops the event loop even when the broker is already gone;
    /// the batch writer's queue closes once the producer is dropped.
    async fn disconnect(&self) -> Result<(), HubError> {
        let producer = self.shared.producer.write().ok().and_then(|mut p| p.take());
        drop(producer);
        let client = self.client.lock().ok().and_then(|mut c| c.take());
        let sent = match client {
            Some(client) => client.disconnect().await.map_err(HubError::from),
            None => Ok(()),
        };
        let handle = self.event_loop.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use tokio::sync::mpsc;

    use super::*;
    use crate::catalog::SensorCatalog;
    use crate::config::SensorConfig;

    fn config() -> HubConfig {
        HubConfig {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "energy-collector-test".into(),
            username: None,
            password: None,
            node: "cs24".into(),
            discovery_prefix: "homeassistant".into(),
            discovery_window_secs: 0,
        }
    }

    fn catalog() -> SensorCatalog {
        SensorCatalog::build(
            &[SensorConfig {
                name: "line1_power".into(),
                display_name: None,
                measurement: "power".into(),
                device: "line1".into(),
                location: None,
                integrate: true,
                enable: true,
            }],
            &[HubEntity {
                name: "line1_power".into(),
                key: entity_key("line1_power"),
                unit: Some("W".into()),
                precision: Some(1),
            }],
        )
    }

    fn producer(counter: Arc<AtomicU64>) -> (SampleProducer, mpsc::UnboundedReceiver<crate::models::SensorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SampleProducer::new(tx, &catalog(), counter, 10), rx)
    }

    #[test]
    fn dispatch_tracks_discovery_and_forwards_states() {
        let shared = HubShared::default();
        let config = config();
        let counter = Arc::new(AtomicU64::new(0));
        let (producer, mut rx) = producer(counter.clone());
        *shared.producer.write().unwrap() = Some(producer);

        let payload = br#"{"name":"line1_power","unit_of_meas":"W","dev":{"name":"cs24-hub"}}"#;
        dispatch(&shared, &config, "homeassistant/sensor/cs24/line1_power/config", payload);
        assert!(shared.entities.read().unwrap().contains_key("line1_power"));
        assert_eq!(shared.identity.read().unwrap().as_ref().unwrap().name, "cs24-hub");

        dispatch(&shared, &config, "cs24/sensor/line1_power/state", b"230.4");
        dispatch(&shared, &config, "cs24/sensor/line1_power/state", b"unavailable");
        dispatch(&shared, &config, "other/sensor/line1_power/state", b"1.0");
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert_eq!(rx.try_recv().unwrap().value, 230.4);
        assert!(rx.try_recv().is_err());

        dispatch(&shared, &config, "homeassistant/sensor/cs24/line1_power/config", b"");
        assert!(shared.entities.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_after_connection_loss_still_releases_producer() {
        let hub = MqttHub::new(config());
        let (client, event_loop) = AsyncClient::new(hub.options(), 8);
        // A failed poll drops the event loop, and with it the request channel.
        drop(event_loop);
        *hub.client.lock().unwrap() = Some(client);
        let parked = tokio::spawn(std::future::pending::<()>());
        *hub.event_loop.lock().unwrap() = Some(parked);

        let (producer, mut rx) = producer(Arc::new(AtomicU64::new(0)));
        hub.subscribe(producer).await.unwrap();

        assert!(hub.disconnect().await.is_err());
        assert!(hub.shared.producer.read().unwrap().is_none());
        assert!(hub.event_loop.lock().unwrap().is_none());
        assert!(rx.recv().await.is_none());
        let (late, _rx) = self::producer(Arc::new(AtomicU64::new(0)));
        assert!(matches!(hub.subscribe(late).await, Err(HubError::NotConnected)));
    }
}
