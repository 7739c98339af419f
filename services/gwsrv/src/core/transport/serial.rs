//! Modbus RTU drive connection over an RS-485 serial line

use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialPort, SerialStream, StopBits};
use tracing::{debug, info, warn};

use super::session::ModbusSession;
use super::{ProtocolConnection, TransportKind};
use crate::error::{GwSrvError, Result};

/// Resolve a configured port to a device path.
///
/// A literal path is returned as is. A glob pattern (`/dev/ttyUSB*`)
/// resolves to the first match in sorted order.
pub fn resolve_port(pattern: &str) -> Option<String> {
    if !pattern.contains(['*', '?', '[']) {
        return Some(pattern.to_string());
    }

    let mut matches: Vec<String> = glob::glob(pattern)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

pub struct SerialConnection {
    port_pattern: String,
    baud_rate: u32,
    slave_id: u8,
    session: ModbusSession,
}

impl SerialConnection {
    pub fn new(port_pattern: &str, baud_rate: u32, slave_id: u8, request_timeout: Duration) -> Self {
        Self {
            port_pattern: port_pattern.to_string(),
            baud_rate,
            slave_id,
            session: ModbusSession::new(
                format!("serial {}@{}", port_pattern, baud_rate),
                request_timeout,
            ),
        }
    }

    fn open(&self, path: &str) -> Result<SerialStream> {
        // 8N1, RTS low at idle so the RS-485 transceiver listens
        let builder = tokio_serial::new(path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.session.request_timeout());
        let mut port = SerialStream::open(&builder)
            .map_err(|e| GwSrvError::connection(format!("{}: {}", path, e)))?;
        if let Err(e) = port.write_request_to_send(false) {
            debug!("{}: RTS control unavailable: {}", path, e);
        }
        Ok(port)
    }
}

#[async_trait]
impl ProtocolConnection for SerialConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.port_pattern, self.baud_rate)
    }

    async fn connect(&self) -> bool {
        if self.session.is_connected() {
            return true;
        }
        let Some(path) = resolve_port(&self.port_pattern) else {
            warn!("No serial port matches {}", self.port_pattern);
            return false;
        };

        match self.open(&path) {
            Ok(port) => {
                let ctx = tokio_modbus::client::rtu::attach_slave(port, Slave(self.slave_id));
                self.session.install(ctx).await;
                info!(
                    "Connected Modbus RTU {} @ {} baud (slave {})",
                    path, self.baud_rate, self.slave_id
                );
                true
            },
            Err(e) => {
                warn!("Modbus RTU connect failed: {}", e);
                false
            },
        }
    }

    async fn disconnect(&self) {
        self.session.close().await;
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.session.read_holding(address, count).await
    }

    async fn write_register(&self, address: u16, value: u16) -> bool {
        self.session.write_register(address, value).await
    }
}
