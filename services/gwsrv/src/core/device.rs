//! Device records and per-device connection configuration

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::transport::TransportKind;
use crate::error::{GwSrvError, Result};

pub const DEFAULT_SLAVE_ID: u8 = 1;
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Keys accepted by a hot connection-config update. `baudrate` is the
/// legacy spelling of `baudRate`.
pub const UPDATABLE_KEYS: &[&str] = &[
    "host",
    "tcpPort",
    "serialPort",
    "baudRate",
    "slaveId",
    "logoIp",
    "logoPort",
    "mode",
];

/// Drive operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Local,
    Remote,
}

/// Which transport carries the drive's telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultReader {
    Tcp,
    Serial,
    /// Served by an external HTTP reader, not by this gateway core
    Http,
}

/// Live connection settings of one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub tcp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(
        default,
        alias = "baudrate",
        deserialize_with = "lenient::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub baud_rate: Option<u32>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub slave_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_ip: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub logo_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_reader: Option<DefaultReader>,
}

impl ConnectionConfig {
    pub fn slave_id(&self) -> u8 {
        self.slave_id.unwrap_or(DEFAULT_SLAVE_ID)
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(DEFAULT_BAUD_RATE)
    }

    pub fn tcp_endpoint(&self) -> Option<(&str, u16)> {
        match (non_empty(&self.host), self.tcp_port) {
            (Some(host), Some(port)) => Some((host, port)),
            _ => None,
        }
    }

    pub fn serial_endpoint(&self) -> Option<(&str, u32)> {
        non_empty(&self.serial_port).map(|port| (port, self.baud_rate()))
    }

    pub fn logo_endpoint(&self) -> Option<(&str, u16)> {
        match (non_empty(&self.logo_ip), self.logo_port) {
            (Some(ip), Some(port)) => Some((ip, port)),
            _ => None,
        }
    }

    /// Primary drive transport.
    ///
    /// Follows `defaultReader`; when it is absent, TCP is preferred if its
    /// endpoint is complete, otherwise serial if a port is set.
    pub fn primary_kind(&self) -> Option<TransportKind> {
        match self.default_reader {
            Some(DefaultReader::Tcp) => Some(TransportKind::Tcp),
            Some(DefaultReader::Serial) => Some(TransportKind::Serial),
            Some(DefaultReader::Http) => None,
            None if self.tcp_endpoint().is_some() => Some(TransportKind::Tcp),
            None if self.serial_endpoint().is_some() => Some(TransportKind::Serial),
            None => None,
        }
    }

    /// Whether this transport is selected at all, regardless of whether its
    /// fields are complete
    pub fn selects(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Logo => self.logo_ip.is_some() || self.logo_port.is_some(),
            primary => self.primary_kind() == Some(primary),
        }
    }

    /// Whether a connection of this kind should exist: selected and complete
    pub fn wants(&self, kind: TransportKind) -> bool {
        self.selects(kind)
            && match kind {
                TransportKind::Tcp => self.tcp_endpoint().is_some(),
                TransportKind::Serial => self.serial_endpoint().is_some(),
                TransportKind::Logo => self.logo_endpoint().is_some(),
            }
    }

    /// Whether the key group that defines `kind`'s connection differs
    pub fn group_changed(&self, other: &ConnectionConfig, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Tcp => {
                self.host != other.host
                    || self.tcp_port != other.tcp_port
                    || self.slave_id != other.slave_id
            },
            TransportKind::Serial => {
                self.serial_port != other.serial_port
                    || self.baud_rate != other.baud_rate
                    || self.slave_id != other.slave_id
            },
            TransportKind::Logo => {
                self.logo_ip != other.logo_ip || self.logo_port != other.logo_port
            },
        }
    }

    /// Merge an update into a copy of this config.
    ///
    /// Only [`UPDATABLE_KEYS`] are merged; other keys are returned as
    /// rejected. A `null` value removes the key. A value of the wrong type
    /// fails the whole update.
    pub fn merged_with(&self, update: &Map<String, Value>) -> Result<(ConnectionConfig, Vec<String>)> {
        let mut current = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(GwSrvError::internal("connection config is not an object")),
        };

        let mut rejected = Vec::new();
        for (key, value) in update {
            let canonical = if key == "baudrate" { "baudRate" } else { key.as_str() };
            if !UPDATABLE_KEYS.contains(&canonical) {
                rejected.push(key.clone());
                continue;
            }
            if value.is_null() {
                current.remove(canonical);
            } else {
                current.insert(canonical.to_string(), value.clone());
            }
        }

        let merged: ConnectionConfig = serde_json::from_value(Value::Object(current))
            .map_err(|e| GwSrvError::validation(format!("connection config: {}", e)))?;
        Ok((merged, rejected))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Device roster entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub serial_number: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub connection_config: ConnectionConfig,
}

impl DeviceRecord {
    pub fn new(serial: impl Into<String>, name: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            serial_number: serial.into(),
            name: name.into(),
            connection_config: config,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RosterRepr {
    List(Vec<DeviceRecord>),
    Wrapped { devices: Vec<DeviceRecord> },
}

/// Parse a roster document: a bare list or `{devices: [...]}`, JSON or YAML
pub fn parse_roster(content: &str) -> Result<Vec<DeviceRecord>> {
    let repr: RosterRepr = serde_yaml::from_str(content)?;
    let devices = match repr {
        RosterRepr::List(devices) | RosterRepr::Wrapped { devices } => devices,
    };
    for device in &devices {
        if device.serial_number.trim().is_empty() {
            return Err(GwSrvError::config("device without serialNumber in roster"));
        }
    }
    Ok(devices)
}

pub fn load_roster(path: &Path) -> Result<Vec<DeviceRecord>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GwSrvError::config(format!("{}: {}", path.display(), e)))?;
    parse_roster(&content)
}

/// Numbers that may arrive as JSON strings from older bus clients
mod lenient {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    pub fn opt_number<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<u64>,
    {
        use serde::de::Error;

        let raw: Option<NumOrString> = Option::deserialize(deserializer)?;
        let number = match raw {
            None => return Ok(None),
            Some(NumOrString::Num(n)) => n,
            Some(NumOrString::Str(s)) if s.trim().is_empty() => return Ok(None),
            Some(NumOrString::Str(s)) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| D::Error::custom(format!("invalid number '{}'", s)))?,
        };
        T::try_from(number)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("number {} out of range", number)))
    }
}
