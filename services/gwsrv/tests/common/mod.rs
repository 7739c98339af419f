//! Test Common Utilities
//!
//! Recording sinks, mock wiring and wait helpers shared by the gwsrv
//! integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use gwsrv::bus::{LinkStatus, SignalSink, StatusSink};
use gwsrv::core::device::{ConnectionConfig, DeviceRecord};
use gwsrv::core::register_map::{RegisterMap, RegisterMaps};
use gwsrv::core::signal::{DecodedSignal, SignalGroup};
use gwsrv::core::transport::{MockConnection, MockConnectionFactory, TransportKind};
use gwsrv::runtime::{GatewayContext, PollerSettings, RuntimeSettings};
use gwsrv::Result;

/// Published signal as seen by the sink
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub serial: String,
    pub group: SignalGroup,
    pub signal: DecodedSignal,
}

#[derive(Default)]
pub struct RecordingSignalSink {
    events: Mutex<Vec<SignalEvent>>,
}

impl RecordingSignalSink {
    pub fn events(&self) -> Vec<SignalEvent> {
        self.events.lock().clone()
    }

    pub fn for_group(&self, group: SignalGroup) -> Vec<SignalEvent> {
        self.events().into_iter().filter(|e| e.group == group).collect()
    }
}

#[async_trait]
impl SignalSink for RecordingSignalSink {
    async fn publish(&self, serial: &str, group: SignalGroup, signal: &DecodedSignal) -> Result<()> {
        self.events.lock().push(SignalEvent {
            serial: serial.to_string(),
            group,
            signal: signal.clone(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStatusSink {
    events: Mutex<Vec<(String, LinkStatus, LinkStatus)>>,
}

impl RecordingStatusSink {
    pub fn events(&self) -> Vec<(String, LinkStatus, LinkStatus)> {
        self.events.lock().clone()
    }

    pub fn last(&self) -> Option<(LinkStatus, LinkStatus)> {
        self.events.lock().last().map(|(_, p, l)| (*p, *l))
    }
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn publish_status(&self, serial: &str, primary: LinkStatus, logo: LinkStatus) -> Result<()> {
        self.events.lock().push((serial.to_string(), primary, logo));
        Ok(())
    }
}

pub fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        poller: PollerSettings {
            interval: Duration::from_millis(10),
            failure_threshold: 3,
        },
        retry_delay: Duration::from_millis(20),
    }
}

/// Mock factory, recording sinks and the context built from them
pub struct Harness {
    pub factory: Arc<MockConnectionFactory>,
    pub signals: Arc<RecordingSignalSink>,
    pub statuses: Arc<RecordingStatusSink>,
    pub ctx: GatewayContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(RegisterMaps::builtin(), fast_settings())
    }

    pub fn with(maps: RegisterMaps, settings: RuntimeSettings) -> Self {
        let factory = Arc::new(MockConnectionFactory::new());
        let signals = Arc::new(RecordingSignalSink::default());
        let statuses = Arc::new(RecordingStatusSink::default());
        let ctx = GatewayContext::new(
            factory.clone(),
            maps,
            signals.clone(),
            statuses.clone(),
            settings,
        );
        Self {
            factory,
            signals,
            statuses,
            ctx,
        }
    }

    /// Queue a mock for `kind` whose register bank answers every address of
    /// the map in use, so polling never declares it lost
    pub fn healthy_mock(&self, kind: TransportKind, endpoint: &str) -> Arc<MockConnection> {
        let conn = healthy_conn(&self.ctx.maps, kind, endpoint);
        self.factory.push(conn.clone());
        conn
    }
}

/// Mock answering every address of the map `maps` holds for `kind`
pub fn healthy_conn(maps: &RegisterMaps, kind: TransportKind, endpoint: &str) -> Arc<MockConnection> {
    let conn = Arc::new(MockConnection::new(kind, endpoint));
    fill_registers(&conn, &maps.for_kind(kind), 0);
    conn
}

pub fn fill_registers(conn: &MockConnection, map: &RegisterMap, value: u16) {
    for address in map.addresses() {
        conn.set_register(address, value);
    }
}

pub fn tcp_logo_record(serial: &str) -> DeviceRecord {
    let config = ConnectionConfig {
        host: Some("10.0.0.5".into()),
        tcp_port: Some(502),
        logo_ip: Some("10.0.0.10".into()),
        logo_port: Some(502),
        ..Default::default()
    };
    DeviceRecord::new(serial, "Pump", config)
}

pub fn tcp_record(serial: &str) -> DeviceRecord {
    let config = ConnectionConfig {
        host: Some("10.0.0.5".into()),
        tcp_port: Some(502),
        ..Default::default()
    };
    DeviceRecord::new(serial, "Drive", config)
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
