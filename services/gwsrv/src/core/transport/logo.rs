//! LOGO controller connection (Modbus TCP, fixed unit id, coil commands)

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::session::ModbusSession;
use super::tcp::open_tcp;
use super::{ProtocolConnection, TransportKind, LOGO_SLAVE_ID};
use crate::error::Result;

pub struct LogoConnection {
    ip: String,
    port: u16,
    session: ModbusSession,
}

impl LogoConnection {
    pub fn new(ip: &str, port: u16, request_timeout: Duration) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            session: ModbusSession::new(format!("logo {}:{}", ip, port), request_timeout),
        }
    }
}

#[async_trait]
impl ProtocolConnection for LogoConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Logo
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    async fn connect(&self) -> bool {
        if self.session.is_connected() {
            return true;
        }
        match open_tcp(&self.ip, self.port, LOGO_SLAVE_ID, self.session.request_timeout()).await {
            Ok(ctx) => {
                self.session.install(ctx).await;
                info!("Connected LOGO {}", self.endpoint());
                true
            },
            Err(e) => {
                warn!("LOGO {} connect failed: {}", self.endpoint(), e);
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

    async fn write_coil(&self, address: u16, value: bool) -> bool {
        self.session.write_coil(address, value).await
    }
}
