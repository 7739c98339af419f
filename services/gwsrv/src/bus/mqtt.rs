//! MQTT bus adapter
//!
//! Publishes decoded signals and link status, and turns inbound command and
//! roster messages into [`BusMessage`]s for the service loop.
//!
//! Topics (`{org}`/`{gw}` from the gateway config):
//! - `tenant/{org}/gateway/{gw}/device/{serial}/signal` (out)
//! - `tenant/{org}/gateway/{gw}/device/{serial}/status` (out)
//! - `tenant/{org}/gateway/{gw}/device/{serial}/command` (in)
//! - `tenant/{org}/gateway/{gw}/devices` (in, full roster)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusMessage, CommandEnvelope, LinkStatus, SignalSink, StatusSink};
use crate::config::AppConfig;
use crate::core::device::parse_roster;
use crate::core::signal::{DecodedSignal, SignalGroup};
use crate::error::{GwSrvError, Result};

const REQUEST_CAPACITY: usize = 10;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Topic layout for one gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTopics {
    base: String,
}

impl MqttTopics {
    pub fn new(organization_id: &str, gateway_id: &str) -> Self {
        Self {
            base: format!("tenant/{}/gateway/{}", organization_id, gateway_id),
        }
    }

    pub fn signal(&self, serial: &str) -> String {
        format!("{}/device/{}/signal", self.base, serial)
    }

    pub fn status(&self, serial: &str) -> String {
        format!("{}/device/{}/status", self.base, serial)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/device/+/command", self.base)
    }

    pub fn roster(&self) -> String {
        format!("{}/devices", self.base)
    }

    /// Serial number of a command topic, `None` for any other topic
    pub fn command_serial<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix("/device/")?;
        let serial = rest.strip_suffix("/command")?;
        if serial.is_empty() || serial.contains('/') {
            return None;
        }
        Some(serial)
    }

    /// Classify and parse an inbound publish
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<BusMessage>> {
        if topic == self.roster() {
            let text = std::str::from_utf8(payload)
                .map_err(|e| GwSrvError::validation(format!("roster payload: {}", e)))?;
            return Ok(Some(BusMessage::Roster(parse_roster(text)?)));
        }
        if let Some(serial) = self.command_serial(topic) {
            let mut envelope: CommandEnvelope = serde_json::from_slice(payload)?;
            envelope.serial = serial.to_string();
            return Ok(Some(BusMessage::Command(envelope)));
        }
        Ok(None)
    }
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub fn signal_payload(group: SignalGroup, signal: &DecodedSignal, at: DateTime<Utc>) -> serde_json::Value {
    json!({ "group": group, "payload": signal, "timestamp": at.to_rfc3339() })
}

pub fn status_payload(primary: LinkStatus, logo: LinkStatus, at: DateTime<Utc>) -> serde_json::Value {
    json!({ "status": primary, "logoStatus": logo, "timestamp": at.to_rfc3339() })
}

/// Connected bus client plus its event-loop task
pub struct MqttBus {
    client: AsyncClient,
    topics: MqttTopics,
    qos: QoS,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Spawn the event loop. Inbound messages go to `tx`; the client
    /// reconnects on its own and resubscribes on every ConnAck.
    pub fn start(config: &AppConfig, tx: mpsc::Sender<BusMessage>) -> Self {
        let mqtt = &config.mqtt;
        let mut options = MqttOptions::new(config.mqtt_client_id(), &mqtt.host, mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs.max(5)));
        if let (Some(username), Some(password)) = (&mqtt.username, &mqtt.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let topics = MqttTopics::new(&config.gateway.organization_id, &config.gateway.gateway_id);
        let qos = qos_from_level(mqtt.qos);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            topics.clone(),
            qos,
            tx,
            cancel.clone(),
        ));
        info!("MQTT bus started: {}:{}", mqtt.host, mqtt.port);

        Self {
            client,
            topics,
            qos,
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn topics(&self) -> &MqttTopics {
        &self.topics
    }

    pub async fn stop(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect: {}", e);
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("MQTT bus stopped");
    }

    /// Queue a message without waiting. While the broker is unreachable the
    /// request queue fills and further messages are dropped.
    fn publish_json(&self, topic: String, payload: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        self.client
            .try_publish(topic.as_str(), self.qos, false, body)
            .map_err(|e| GwSrvError::bus(format!("publish {} dropped: {}", topic, e)))?;
        debug!("Published to {}", topic);
        Ok(())
    }
}

#[async_trait]
impl SignalSink for MqttBus {
    async fn publish(&self, serial: &str, group: SignalGroup, signal: &DecodedSignal) -> Result<()> {
        let payload = signal_payload(group, signal, Utc::now());
        self.publish_json(self.topics.signal(serial), &payload)
    }
}

#[async_trait]
impl StatusSink for MqttBus {
    async fn publish_status(&self, serial: &str, primary: LinkStatus, logo: LinkStatus) -> Result<()> {
        let payload = status_payload(primary, logo, Utc::now());
        self.publish_json(self.topics.status(serial), &payload)
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: MqttTopics,
    qos: QoS,
    tx: mpsc::Sender<BusMessage>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected, subscribing");
                for filter in [topics.command_filter(), topics.roster()] {
                    if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                        error!("MQTT subscribe {} failed: {}", filter, e);
                    }
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match topics.decode(&publish.topic, &publish.payload) {
                    Ok(Some(message)) => {
                        if tx.send(message).await.is_err() {
                            debug!("Bus receiver dropped, stopping MQTT loop");
                            break;
                        }
                    },
                    Ok(None) => debug!("Ignoring message on {}", publish.topic),
                    Err(e) => warn!("Bad message on {}: {}", publish.topic, e),
                }
            },
            Ok(_) => {},
            Err(e) => {
                error!("MQTT event loop error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {},
                }
            },
        }
    }
}
