//! Per-device link health, aggregated over all transports

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::reconnect::ConnectionState;
use crate::bus::{LinkStatus, StatusSink};
use crate::core::transport::TransportKind;

/// Upper bound on one status publish
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Aggregated device health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealth {
    /// TCP or Serial drive link connected
    pub primary_online: bool,
    pub logo_online: bool,
}

impl DeviceHealth {
    pub fn primary_status(&self) -> LinkStatus {
        LinkStatus::from_online(self.primary_online)
    }

    pub fn logo_status(&self) -> LinkStatus {
        LinkStatus::from_online(self.logo_online)
    }
}

#[derive(Debug, Default)]
struct HealthState {
    links: HashMap<TransportKind, ConnectionState>,
    last: DeviceHealth,
    /// Bumped on every health change
    seq: u64,
    closed: bool,
}

impl HealthState {
    fn compute(&self) -> DeviceHealth {
        let connected = |kind| self.links.get(&kind) == Some(&ConnectionState::Connected);
        DeviceHealth {
            primary_online: connected(TransportKind::Tcp) || connected(TransportKind::Serial),
            logo_online: connected(TransportKind::Logo),
        }
    }

    fn apply(&mut self) -> Option<HealthChange> {
        let next = self.compute();
        if self.closed || next == self.last {
            return None;
        }
        self.last = next;
        self.seq += 1;
        Some(HealthChange {
            seq: self.seq,
            health: next,
        })
    }
}

/// A health change recorded but not yet reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct HealthChange {
    seq: u64,
    pub health: DeviceHealth,
}

/// Tracks link states for one device and reports each health change once.
///
/// Starts offline/offline. After [`close`](Self::close) nothing is reported.
///
/// Recording and reporting are split: callers record under their own locks
/// and report after releasing them, so a slow status sink never holds up a
/// state transition. A report older than one already sent is dropped.
pub struct HealthMonitor {
    serial: String,
    sink: Arc<dyn StatusSink>,
    state: parking_lot::Mutex<HealthState>,
    /// Sequence number of the last reported change
    reported: Mutex<u64>,
}

impl HealthMonitor {
    pub fn new(serial: impl Into<String>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            serial: serial.into(),
            sink,
            state: parking_lot::Mutex::new(HealthState::default()),
            reported: Mutex::new(0),
        }
    }

    /// Record a transport's new state
    pub fn record(&self, kind: TransportKind, link: ConnectionState) -> Option<HealthChange> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.links.insert(kind, link);
        state.apply()
    }

    /// Record that a transport no longer exists
    pub fn record_removed(&self, kind: TransportKind) -> Option<HealthChange> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.links.remove(&kind);
        state.apply()
    }

    /// Send a recorded change to the status sink
    pub async fn report(&self, change: Option<HealthChange>) {
        let Some(change) = change else {
            return;
        };
        let mut reported = self.reported.lock().await;
        if *reported >= change.seq || self.state.lock().closed {
            debug!("{} health #{} superseded", self.serial, change.seq);
            return;
        }
        *reported = change.seq;

        let health = change.health;
        info!(
            "Device {} status: primary={} logo={}",
            self.serial,
            health.primary_status(),
            health.logo_status()
        );
        let publish = self
            .sink
            .publish_status(&self.serial, health.primary_status(), health.logo_status());
        match tokio::time::timeout(REPORT_TIMEOUT, publish).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("Device {} status publish failed: {}", self.serial, e),
            Err(_) => warn!("Device {} status publish timed out, dropped", self.serial),
        }
    }

    /// Record and report in one step
    pub async fn observe(&self, kind: TransportKind, link: ConnectionState) {
        let change = self.record(kind, link);
        self.report(change).await;
    }

    /// Drop a transport that no longer exists
    pub async fn forget(&self, kind: TransportKind) {
        let change = self.record_removed(kind);
        self.report(change).await;
    }

    /// Recompute without a new observation
    pub async fn recompute(&self) {
        let change = self.state.lock().apply();
        self.report(change).await;
    }

    pub async fn current(&self) -> DeviceHealth {
        self.state.lock().last
    }

    /// Stop reporting; later observations are ignored
    pub async fn close(&self) {
        self.state.lock().closed = true;
    }
}
