//! Collaborator boundary: telemetry sinks and inbound bus messages

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::device::DeviceRecord;
use crate::core::signal::{DecodedSignal, SignalGroup};
use crate::error::Result;

pub mod mqtt;

pub use mqtt::MqttBus;

/// Link status reported per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Online,
    Offline,
}

impl LinkStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            LinkStatus::Online
        } else {
            LinkStatus::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Online => "online",
            LinkStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives decoded signal sets. Called concurrently from every poller;
/// an error is logged by the caller and never stops polling.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn publish(&self, serial: &str, group: SignalGroup, signal: &DecodedSignal) -> Result<()>;
}

/// Receives device link status transitions
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish_status(&self, serial: &str, primary: LinkStatus, logo: LinkStatus) -> Result<()>;
}

/// Action carried by a command envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandAction {
    /// `{value: on|off|restart|local|remote|1|0|2}`
    UpdateStatus,
    /// Connection-config keys to merge
    UpdateConnections,
    /// `{connectionConfig: {...}, name?}`
    UpdateConfig,
}

/// Inbound command addressed to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub serial: String,
    pub action: CommandAction,
    #[serde(default)]
    pub params: Value,
}

impl CommandEnvelope {
    pub fn new(serial: impl Into<String>, action: CommandAction, params: Value) -> Self {
        Self {
            serial: serial.into(),
            action,
            params,
        }
    }
}

/// Everything the bus delivers to the gateway loop
#[derive(Debug, Clone)]
pub enum BusMessage {
    Command(CommandEnvelope),
    Roster(Vec<DeviceRecord>),
}
