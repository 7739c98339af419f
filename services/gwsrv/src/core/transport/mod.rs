//! Protocol connections
//!
//! One [`ProtocolConnection`] owns one transport handle to one device:
//! Modbus TCP, Modbus RTU over a serial line, or the LOGO controller's
//! Modbus TCP session. Connections expose raw register access only; polling
//! and supervision live in `runtime`.
//!
//! Failures never cross this boundary as panics: `connect` and the write
//! operations report a flag, reads report a `Result` the poller counts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::device::ConnectionConfig;
use crate::error::Result;

pub mod logo;
pub mod mock;
pub mod serial;
mod session;
pub mod tcp;

pub use logo::LogoConnection;
pub use mock::{MockConnection, MockConnectionFactory};
pub use serial::SerialConnection;
pub use tcp::TcpConnection;

/// Slave/unit id the LOGO controller answers on
pub const LOGO_SLAVE_ID: u8 = 1;

/// Transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Serial,
    Logo,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Tcp, TransportKind::Serial, TransportKind::Logo];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Serial => "serial",
            TransportKind::Logo => "logo",
        }
    }

    /// TCP and Serial carry the drive; LOGO is the supervisory controller
    pub fn is_primary(&self) -> bool {
        !matches!(self, TransportKind::Logo)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw register access over one transport
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint for logs (`10.0.0.5:502`, `/dev/ttyUSB0@9600`)
    fn endpoint(&self) -> String;

    /// Open the transport. `false` on any failure; the reason is logged.
    async fn connect(&self) -> bool;

    /// Close the transport. Safe to call when already closed.
    async fn disconnect(&self);

    /// Cheap liveness check of the transport handle
    fn is_connected(&self) -> bool;

    /// One request/response round trip
    async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Write one holding register. Rejected while not connected.
    async fn write_register(&self, address: u16, value: u16) -> bool;

    /// Write one coil. Only the LOGO transport drives coils.
    async fn write_coil(&self, address: u16, value: bool) -> bool {
        warn!(
            "{} transport has no coils, write {}={} ignored",
            self.kind(),
            address,
            value
        );
        false
    }
}

/// Builds connections for a device from its connection config
pub trait ConnectionFactory: Send + Sync {
    /// `None` when the config lacks the fields this transport needs
    fn build(&self, kind: TransportKind, config: &ConnectionConfig) -> Option<Arc<dyn ProtocolConnection>>;
}

/// Production factory: real Modbus TCP / RTU / LOGO connections
#[derive(Debug, Clone)]
pub struct ModbusConnectionFactory {
    request_timeout: Duration,
}

impl ModbusConnectionFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl ConnectionFactory for ModbusConnectionFactory {
    fn build(&self, kind: TransportKind, config: &ConnectionConfig) -> Option<Arc<dyn ProtocolConnection>> {
        match kind {
            TransportKind::Tcp => {
                let (host, port) = config.tcp_endpoint()?;
                Some(Arc::new(TcpConnection::new(
                    host,
                    port,
                    config.slave_id(),
                    self.request_timeout,
                )))
            },
            TransportKind::Serial => {
                let (port, baud) = config.serial_endpoint()?;
                Some(Arc::new(SerialConnection::new(
                    port,
                    baud,
                    config.slave_id(),
                    self.request_timeout,
                )))
            },
            TransportKind::Logo => {
                let (ip, port) = config.logo_endpoint()?;
                Some(Arc::new(LogoConnection::new(ip, port, self.request_timeout)))
            },
        }
    }
}
