//! Runtime workers and aggregates
//!
//! - [`ReconnectSupervisor`]: connect/retry loop per connection
//! - [`RegisterPoller`]: cyclic reads, decoding and failure detection
//! - [`HealthMonitor`]: edge-triggered device status
//! - [`DeviceOrchestrator`]: one device, up to three transports
//! - [`GatewayRegistry`]: the live device set and command routing

use std::sync::Arc;
use std::time::Duration;

use crate::bus::{SignalSink, StatusSink};
use crate::core::register_map::RegisterMaps;
use crate::core::transport::ConnectionFactory;

pub mod health;
pub mod orchestrator;
pub mod poller;
pub mod reconnect;
pub mod registry;

pub use health::{DeviceHealth, HealthChange, HealthMonitor};
pub use orchestrator::{ConfigUpdateReport, DeviceOrchestrator};
pub use poller::{PollExit, PollerSettings, RegisterPoller};
pub use reconnect::{ConnectionState, ReconnectStats, ReconnectSupervisor, DEFAULT_RETRY_DELAY};
pub use registry::{CommandOutcome, DeviceRef, GatewayRegistry};

/// Timing for supervisors and pollers
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub poller: PollerSettings,
    /// Fixed delay between connect attempts
    pub retry_delay: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poller: PollerSettings::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Shared collaborators handed to every device
#[derive(Clone)]
pub struct GatewayContext {
    pub factory: Arc<dyn ConnectionFactory>,
    pub maps: RegisterMaps,
    pub signal_sink: Arc<dyn SignalSink>,
    pub status_sink: Arc<dyn StatusSink>,
    pub settings: RuntimeSettings,
}

impl GatewayContext {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        maps: RegisterMaps,
        signal_sink: Arc<dyn SignalSink>,
        status_sink: Arc<dyn StatusSink>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            factory,
            maps,
            signal_sink,
            status_sink,
            settings,
        }
    }
}
