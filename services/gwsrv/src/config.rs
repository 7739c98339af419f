//! Service configuration
//!
//! Priority (highest to lowest):
//! 1. Environment variables `GWSRV_<SECTION>__<KEY>` (e.g. `GWSRV_MQTT__HOST`)
//! 2. Config file (`config/gwsrv.yaml` by default; YAML, TOML or JSON)
//! 3. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{GwSrvError, Result};
use crate::runtime::{PollerSettings, RuntimeSettings};

pub const DEFAULT_CONFIG_PATH: &str = "config/gwsrv.yaml";
pub const ENV_PREFIX: &str = "GWSRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
    /// Daily log files go here; console only when unset
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "gwsrv".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
        }
    }
}

/// Identity of this gateway on the bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub organization_id: String,
    pub gateway_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Defaults to `gwsrv_<gateway_id>`
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    /// 0, 1 or 2
    pub qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: 30,
            qos: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub failure_threshold: u32,
    /// Bound on every connect and Modbus request
    pub request_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            failure_threshold: 3,
            request_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub retry_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 5000,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub gateway: GatewayConfig,
    pub mqtt: MqttConfig,
    pub polling: PollingConfig,
    pub reconnect: ReconnectConfig,
    /// Device roster loaded at startup (YAML or JSON)
    pub devices_file: Option<PathBuf>,
    /// Directory with `tcp.yaml` / `serial.yaml` / `logo.yaml` map overrides
    pub register_map_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Defaults, then the file (if it exists), then the environment
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if path.exists() {
            let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("yaml");
            figment = match extension {
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "json" => figment.merge(Json::file(path)),
                other => {
                    return Err(GwSrvError::config(format!(
                        "Unsupported config format: {}",
                        other
                    )))
                },
            };
        } else {
            tracing::warn!("Config file {:?} not found, using defaults", path);
        }

        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            return Err(GwSrvError::config("polling.interval_ms must be positive"));
        }
        if self.polling.failure_threshold == 0 {
            return Err(GwSrvError::config("polling.failure_threshold must be positive"));
        }
        if self.polling.request_timeout_ms == 0 {
            return Err(GwSrvError::config("polling.request_timeout_ms must be positive"));
        }
        if self.mqtt.qos > 2 {
            return Err(GwSrvError::config(format!("mqtt.qos {} is not 0, 1 or 2", self.mqtt.qos)));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(GwSrvError::config("mqtt.host is empty"));
        }
        Ok(())
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            poller: PollerSettings {
                interval: Duration::from_millis(self.polling.interval_ms),
                failure_threshold: self.polling.failure_threshold,
            },
            retry_delay: Duration::from_millis(self.reconnect.retry_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.polling.request_timeout_ms)
    }

    pub fn mqtt_client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("gwsrv_{}", self.gateway.gateway_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_figment(Figment::from(Serialized::defaults(AppConfig::default())))
            .unwrap();
        let settings = config.runtime_settings();
        assert_eq!(settings.poller.interval, Duration::from_millis(500));
        assert_eq!(settings.poller.failure_threshold, 3);
        assert_eq!(settings.retry_delay, Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gwsrv.yaml");
        std::fs::write(
            &path,
            "gateway:\n  organization_id: org-1\n  gateway_id: gw-7\nmqtt:\n  host: broker.local\npolling:\n  interval_ms: 250\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.gateway.gateway_id, "gw-7");
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.polling.interval_ms, 250);
        assert_eq!(config.polling.failure_threshold, 3);
        assert_eq!(config.mqtt_client_id(), "gwsrv_gw-7");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.polling.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gwsrv.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
