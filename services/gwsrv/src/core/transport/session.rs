//! Modbus client context shared by the real transports

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::error::{GwSrvError, Result};

/// One Modbus client context behind a mutex, so at most one request is in
/// flight per transport.
pub(crate) struct ModbusSession {
    label: String,
    client: Mutex<Option<Context>>,
    connected: AtomicBool,
    request_timeout: Duration,
}

impl ModbusSession {
    pub(crate) fn new(label: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            label: label.into(),
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
            request_timeout,
        }
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) async fn install(&self, ctx: Context) {
        let mut client = self.client.lock().await;
        *client = Some(ctx);
        self.connected.store(true, Ordering::Release);
    }

    /// Drop the context, closing the socket or port
    pub(crate) async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        let mut client = self.client.lock().await;
        if client.take().is_some() {
            debug!("Closed {}", self.label);
        }
    }

    pub(crate) async fn read_holding(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut guard = self.client.lock().await;
        let ctx = guard.as_mut().ok_or_else(GwSrvError::not_connected)?;

        match timeout(self.request_timeout, ctx.read_holding_registers(address, count)).await {
            Ok(Ok(values)) if values.len() == count as usize => Ok(values),
            Ok(Ok(values)) => Err(GwSrvError::protocol(format!(
                "{}: read {}x{} returned {} registers",
                self.label,
                address,
                count,
                values.len()
            ))),
            Ok(Err(e)) => Err(GwSrvError::io(format!("{}: read {}: {}", self.label, address, e))),
            Err(_) => Err(GwSrvError::timeout(format!(
                "{}: read {} after {:?}",
                self.label, address, self.request_timeout
            ))),
        }
    }

    pub(crate) async fn write_register(&self, address: u16, value: u16) -> bool {
        if !self.is_connected() {
            warn!("{}: write {}={} rejected, not connected", self.label, address, value);
            return false;
        }
        let mut guard = self.client.lock().await;
        let Some(ctx) = guard.as_mut() else {
            warn!("{}: write {}={} rejected, not connected", self.label, address, value);
            return false;
        };

        match timeout(self.request_timeout, ctx.write_single_register(address, value)).await {
            Ok(Ok(())) => {
                debug!("{}: wrote register {}={}", self.label, address, value);
                true
            },
            Ok(Err(e)) => {
                warn!("{}: write register {}={} failed: {}", self.label, address, value, e);
                false
            },
            Err(_) => {
                warn!("{}: write register {}={} timed out", self.label, address, value);
                false
            },
        }
    }

    pub(crate) async fn write_coil(&self, address: u16, value: bool) -> bool {
        if !self.is_connected() {
            warn!("{}: coil {}={} rejected, not connected", self.label, address, value);
            return false;
        }
        let mut guard = self.client.lock().await;
        let Some(ctx) = guard.as_mut() else {
            warn!("{}: coil {}={} rejected, not connected", self.label, address, value);
            return false;
        };

        match timeout(self.request_timeout, ctx.write_single_coil(address, value)).await {
            Ok(Ok(())) => {
                debug!("{}: wrote coil {}={}", self.label, address, value);
                true
            },
            Ok(Err(e)) => {
                warn!("{}: write coil {}={} failed: {}", self.label, address, value, e);
                false
            },
            Err(_) => {
                warn!("{}: write coil {}={} timed out", self.label, address, value);
                false
            },
        }
    }
}
