//! Live device set and inbound command routing

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::orchestrator::{ConfigUpdateReport, DeviceOrchestrator};
use super::GatewayContext;
use crate::bus::{CommandAction, CommandEnvelope};
use crate::core::command::DeviceCommand;
use crate::core::device::{ConnectionConfig, DeviceRecord};
use crate::core::transport::TransportKind;
use crate::error::{GwSrvError, Result};

/// A device as seen by collaborators: a roster entry not (yet) running, or
/// a live orchestrator
#[derive(Clone)]
pub enum DeviceRef {
    FromConfig(DeviceRecord),
    FromOrchestrator(Arc<DeviceOrchestrator>),
}

impl DeviceRef {
    pub fn serial(&self) -> &str {
        match self {
            DeviceRef::FromConfig(record) => &record.serial_number,
            DeviceRef::FromOrchestrator(orch) => orch.serial(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            DeviceRef::FromConfig(record) => record.name.clone(),
            DeviceRef::FromOrchestrator(orch) => orch.name(),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        match self {
            DeviceRef::FromConfig(record) => record.connection_config.clone(),
            DeviceRef::FromOrchestrator(orch) => orch.connection_config(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, DeviceRef::FromOrchestrator(_))
    }

    pub fn record(&self) -> DeviceRecord {
        match self {
            DeviceRef::FromConfig(record) => record.clone(),
            DeviceRef::FromOrchestrator(orch) => orch.record(),
        }
    }
}

/// What a dispatched command did
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Executed {
        command: DeviceCommand,
        transport: TransportKind,
    },
    Reconfigured(ConfigUpdateReport),
}

pub struct GatewayRegistry {
    devices: RwLock<HashMap<String, Arc<DeviceOrchestrator>>>,
    ctx: GatewayContext,
}

impl GatewayRegistry {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            ctx,
        }
    }

    /// Replace the device set.
    ///
    /// Every current orchestrator is fully stopped before any new one is
    /// built, so one serial never has two live orchestrators.
    pub async fn reload(&self, records: Vec<DeviceRecord>) {
        let mut devices = self.devices.write().await;
        stop_all(devices.drain().map(|(_, orch)| orch)).await;

        for record in records {
            if devices.contains_key(&record.serial_number) {
                warn!("Duplicate device {} in roster, keeping the first", record.serial_number);
                continue;
            }
            let serial = record.serial_number.clone();
            let orch = Arc::new(DeviceOrchestrator::new(record, self.ctx.clone()));
            orch.start();
            devices.insert(serial, orch);
        }
        info!("Device registry loaded: {} devices", devices.len());
    }

    pub async fn get(&self, serial: &str) -> Option<Arc<DeviceOrchestrator>> {
        self.devices.read().await.get(serial).cloned()
    }

    pub async fn devices(&self) -> Vec<DeviceRef> {
        let devices = self.devices.read().await;
        let mut refs: Vec<DeviceRef> = devices
            .values()
            .map(|orch| DeviceRef::FromOrchestrator(Arc::clone(orch)))
            .collect();
        refs.sort_by(|a, b| a.serial().cmp(b.serial()));
        refs
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Route one inbound command to its device
    pub async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        let orch = self
            .get(&envelope.serial)
            .await
            .ok_or_else(|| GwSrvError::device_not_found(&envelope.serial))?;

        match envelope.action {
            CommandAction::UpdateStatus => {
                let value = envelope
                    .params
                    .get("value")
                    .ok_or_else(|| GwSrvError::validation("update-status without value"))?;
                let command = DeviceCommand::from_status_value(value).ok_or_else(|| {
                    GwSrvError::validation(format!("unsupported status value {}", value))
                })?;
                let transport = orch.execute(command).await?;
                Ok(CommandOutcome::Executed { command, transport })
            },
            CommandAction::UpdateConnections => {
                let update = envelope.params.as_object().ok_or_else(|| {
                    GwSrvError::validation("update-connections params must be an object")
                })?;
                let report = orch.update_connection_config(update).await?;
                Ok(CommandOutcome::Reconfigured(report))
            },
            CommandAction::UpdateConfig => {
                if let Some(name) = envelope.params.get("name").and_then(Value::as_str) {
                    orch.set_name(name);
                }
                let report = match envelope.params.get("connectionConfig") {
                    Some(Value::Object(update)) => orch.update_connection_config(update).await?,
                    Some(Value::Null) | None => ConfigUpdateReport::default(),
                    Some(_) => {
                        return Err(GwSrvError::validation("connectionConfig must be an object"))
                    },
                };
                Ok(CommandOutcome::Reconfigured(report))
            },
        }
    }

    /// Stop every device and empty the registry
    pub async fn shutdown(&self) {
        let mut devices = self.devices.write().await;
        stop_all(devices.drain().map(|(_, orch)| orch)).await;
        info!("Device registry shut down");
    }
}

async fn stop_all(orchestrators: impl Iterator<Item = Arc<DeviceOrchestrator>>) {
    let stops: Vec<_> = orchestrators
        .map(|orch| async move { orch.stop().await })
        .collect();
    join_all(stops).await;
}
