//! Per-device orchestration
//!
//! A [`DeviceOrchestrator`] owns up to three supervised connections for one
//! device (TCP or Serial for the drive, plus LOGO), its live connection
//! config and its aggregated health. Commands go to the first connected
//! transport in priority order; hot config updates restart only the
//! transports whose settings changed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::health::{DeviceHealth, HealthMonitor};
use super::poller::RegisterPoller;
use super::reconnect::{ConnectionState, ReconnectSupervisor};
use super::GatewayContext;
use crate::core::command::{self, DeviceCommand};
use crate::core::device::{ConnectionConfig, DefaultReader, DeviceRecord, Mode};
use crate::core::transport::TransportKind;
use crate::error::{GwSrvError, Result};

/// Order for on/off/restart: the supervisory controller first
pub const DRIVE_COMMAND_ORDER: [TransportKind; 3] =
    [TransportKind::Logo, TransportKind::Tcp, TransportKind::Serial];

/// Order for local/remote: LOGO has no mode
pub const MODE_COMMAND_ORDER: [TransportKind; 2] = [TransportKind::Serial, TransportKind::Tcp];

/// Outcome of a hot connection-config update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdateReport {
    /// Keys outside the updatable set; not merged
    pub rejected_keys: Vec<String>,
    /// Transports stopped, rebuilt or removed
    pub restarted: Vec<TransportKind>,
    pub mode_changed: bool,
}

impl ConfigUpdateReport {
    pub fn is_noop(&self) -> bool {
        self.restarted.is_empty() && !self.mode_changed
    }
}

pub struct DeviceOrchestrator {
    serial: String,
    name: RwLock<String>,
    config: RwLock<ConnectionConfig>,
    /// Held for the whole of a config update
    update_lock: Mutex<()>,
    supervisors: RwLock<BTreeMap<TransportKind, Arc<ReconnectSupervisor>>>,
    health: Arc<HealthMonitor>,
    ctx: GatewayContext,
    started: AtomicBool,
}

impl DeviceOrchestrator {
    /// Build connections for every transport the config selects
    pub fn new(record: DeviceRecord, ctx: GatewayContext) -> Self {
        let health = Arc::new(HealthMonitor::new(
            record.serial_number.clone(),
            Arc::clone(&ctx.status_sink),
        ));
        let orchestrator = Self {
            serial: record.serial_number,
            name: RwLock::new(record.name),
            config: RwLock::new(record.connection_config),
            update_lock: Mutex::new(()),
            supervisors: RwLock::new(BTreeMap::new()),
            health,
            ctx,
            started: AtomicBool::new(false),
        };

        let config = orchestrator.connection_config();
        if config.default_reader == Some(DefaultReader::Http) {
            info!(
                "Device {}: drive read over http, not served by the gateway",
                orchestrator.serial
            );
        }
        {
            let mut supervisors = orchestrator.supervisors.write();
            for kind in TransportKind::ALL {
                if let Some(sup) = orchestrator.build_supervisor(kind, &config) {
                    supervisors.insert(kind, sup);
                }
            }
        }
        orchestrator
    }

    fn build_supervisor(&self, kind: TransportKind, config: &ConnectionConfig) -> Option<Arc<ReconnectSupervisor>> {
        if !config.selects(kind) {
            return None;
        }
        if !config.wants(kind) {
            error!(
                "Device {}: {} selected but its connection settings are incomplete",
                self.serial, kind
            );
            return None;
        }
        let Some(conn) = self.ctx.factory.build(kind, config) else {
            error!("Device {}: could not build {} connection", self.serial, kind);
            return None;
        };

        let settings = &self.ctx.settings;
        let poller = RegisterPoller::new(
            self.serial.clone(),
            Arc::clone(&conn),
            self.ctx.maps.for_kind(kind),
            Arc::clone(&self.ctx.signal_sink),
            settings.poller,
        );
        debug!("Device {}: {} -> {}", self.serial, kind, conn.endpoint());
        Some(Arc::new(ReconnectSupervisor::new(
            self.serial.clone(),
            conn,
            poller,
            settings.retry_delay,
            Arc::clone(&self.health),
        )))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        self.config.read().clone()
    }

    pub fn record(&self) -> DeviceRecord {
        DeviceRecord::new(self.serial.clone(), self.name(), self.connection_config())
    }

    pub fn transports(&self) -> Vec<TransportKind> {
        self.supervisors.read().keys().copied().collect()
    }

    pub fn supervisor(&self, kind: TransportKind) -> Option<Arc<ReconnectSupervisor>> {
        self.supervisors.read().get(&kind).cloned()
    }

    pub fn connection_state(&self, kind: TransportKind) -> Option<ConnectionState> {
        self.supervisor(kind).map(|sup| sup.state())
    }

    pub async fn health(&self) -> DeviceHealth {
        self.health.current().await
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start supervising every constructed connection
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        let supervisors: Vec<_> = self.supervisors.read().values().cloned().collect();
        info!(
            "Device {} ({}) starting {:?}",
            self.serial,
            self.name(),
            supervisors.iter().map(|s| s.kind()).collect::<Vec<_>>()
        );
        for sup in supervisors {
            sup.start();
        }
    }

    /// Stop all supervision and close every connection. No final status is
    /// published.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.health.close().await;
        let supervisors: Vec<_> = self.supervisors.read().values().cloned().collect();
        for sup in supervisors {
            sup.stop().await;
        }
        info!("Device {} stopped", self.serial);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub async fn turn_on(&self) -> Result<TransportKind> {
        self.dispatch(DeviceCommand::TurnOn, &DRIVE_COMMAND_ORDER).await
    }

    /// Turn off, then leave the drive in local mode.
    ///
    /// The result is that of the off write; a failed mode change is only
    /// logged.
    pub async fn turn_off(&self) -> Result<TransportKind> {
        let kind = self.dispatch(DeviceCommand::TurnOff, &DRIVE_COMMAND_ORDER).await?;
        if let Err(e) = self.set_local().await {
            warn!("Device {}: local mode after turn-off not applied: {}", self.serial, e);
        }
        Ok(kind)
    }

    pub async fn restart(&self) -> Result<TransportKind> {
        self.dispatch(DeviceCommand::Restart, &DRIVE_COMMAND_ORDER).await
    }

    pub async fn set_local(&self) -> Result<TransportKind> {
        self.dispatch(DeviceCommand::SetLocal, &MODE_COMMAND_ORDER).await
    }

    pub async fn set_remote(&self) -> Result<TransportKind> {
        self.dispatch(DeviceCommand::SetRemote, &MODE_COMMAND_ORDER).await
    }

    pub async fn execute(&self, command: DeviceCommand) -> Result<TransportKind> {
        match command {
            DeviceCommand::TurnOn => self.turn_on().await,
            DeviceCommand::TurnOff => self.turn_off().await,
            DeviceCommand::Restart => self.restart().await,
            DeviceCommand::SetLocal => self.set_local().await,
            DeviceCommand::SetRemote => self.set_remote().await,
        }
    }

    async fn dispatch(&self, command: DeviceCommand, order: &[TransportKind]) -> Result<TransportKind> {
        for &kind in order {
            let Some(sup) = self.supervisor(kind) else {
                continue;
            };
            let conn = sup.connection();
            if !conn.is_connected() {
                debug!("Device {}: {} skipped for {}, not connected", self.serial, kind, command);
                continue;
            }
            if command::execute(conn.as_ref(), command).await {
                info!("Device {}: {} via {}", self.serial, command, kind);
                return Ok(kind);
            }
        }

        warn!("Device {}: {} failed on every transport", self.serial, command);
        Err(GwSrvError::command(format!(
            "{} on {}: no connected transport accepted the command",
            command, self.serial
        )))
    }

    // ------------------------------------------------------------------
    // Hot config update
    // ------------------------------------------------------------------

    /// Merge an update into the live config and restart affected transports
    pub async fn update_connection_config(&self, update: &Map<String, Value>) -> Result<ConfigUpdateReport> {
        let _update = self.update_lock.lock().await;

        let old = self.connection_config();
        let (new, rejected_keys) = old.merged_with(update)?;
        if !rejected_keys.is_empty() {
            warn!(
                "Device {}: ignored connection keys {:?}",
                self.serial, rejected_keys
            );
        }
        *self.config.write() = new.clone();

        let mut report = ConfigUpdateReport {
            rejected_keys,
            ..Default::default()
        };

        for kind in TransportKind::ALL {
            let affected = new.group_changed(&old, kind)
                || new.selects(kind) != old.selects(kind)
                || new.wants(kind) != old.wants(kind);
            if !affected {
                continue;
            }

            let previous = self.supervisors.write().remove(&kind);
            let had_previous = previous.is_some();
            if let Some(sup) = previous {
                sup.stop().await;
            }

            match self.build_supervisor(kind, &new) {
                Some(sup) => {
                    self.supervisors.write().insert(kind, Arc::clone(&sup));
                    if self.is_started() {
                        sup.start();
                    }
                    info!("Device {}: {} restarted with new settings", self.serial, kind);
                    report.restarted.push(kind);
                },
                None if had_previous => {
                    self.health.forget(kind).await;
                    info!("Device {}: {} removed", self.serial, kind);
                    report.restarted.push(kind);
                },
                None => {},
            }
        }

        if new.mode != old.mode {
            if let Some(mode) = new.mode {
                report.mode_changed = true;
                let result = match mode {
                    Mode::Local => self.set_local().await,
                    Mode::Remote => self.set_remote().await,
                };
                if let Err(e) = result {
                    warn!("Device {}: mode change to {:?} not applied: {}", self.serial, mode, e);
                }
            }
        }

        if report.is_noop() {
            debug!("Device {}: connection update changed nothing", self.serial);
        }
        Ok(report)
    }
}
