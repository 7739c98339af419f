//! Modbus TCP drive connection

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{info, warn};

use super::session::ModbusSession;
use super::{ProtocolConnection, TransportKind};
use crate::error::{GwSrvError, Result};

/// Resolve `host:port` and open a Modbus TCP context, all within `limit`
pub(crate) async fn open_tcp(host: &str, port: u16, slave: u8, limit: Duration) -> Result<Context> {
    let addr: SocketAddr = timeout(limit, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| GwSrvError::timeout(format!("resolving {}:{}", host, port)))??
        .next()
        .ok_or_else(|| GwSrvError::connection(format!("{}:{} did not resolve", host, port)))?;

    match timeout(limit, tokio_modbus::client::tcp::connect_slave(addr, Slave(slave))).await {
        Ok(Ok(ctx)) => Ok(ctx),
        Ok(Err(e)) => Err(GwSrvError::connection(format!("{}: {}", addr, e))),
        Err(_) => Err(GwSrvError::timeout(format!(
            "connect to {} timed out after {:?}",
            addr, limit
        ))),
    }
}

pub struct TcpConnection {
    host: String,
    port: u16,
    slave_id: u8,
    session: ModbusSession,
}

impl TcpConnection {
    pub fn new(host: &str, port: u16, slave_id: u8, request_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            slave_id,
            session: ModbusSession::new(format!("tcp {}:{}", host, port), request_timeout),
        }
    }
}

#[async_trait]
impl ProtocolConnection for TcpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> bool {
        if self.session.is_connected() {
            return true;
        }
        match open_tcp(&self.host, self.port, self.slave_id, self.session.request_timeout()).await {
            Ok(ctx) => {
                self.session.install(ctx).await;
                info!(
                    "Connected Modbus TCP {} (slave {})",
                    self.endpoint(),
                    self.slave_id
                );
                true
            },
            Err(e) => {
                warn!("Modbus TCP {} connect failed: {}", self.endpoint(), e);
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
