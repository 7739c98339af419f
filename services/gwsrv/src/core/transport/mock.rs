//! Mock connection for testing
//!
//! Scripted connect results, an in-memory register bank, injectable read
//! failures and a log of every write. Used by the integration tests to drive
//! supervisors, pollers and orchestrators without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{ConnectionFactory, ProtocolConnection, TransportKind};
use crate::core::command::WriteOp;
use crate::core::device::ConnectionConfig;
use crate::error::{GwSrvError, Result};

#[derive(Debug, Default)]
struct MockState {
    connect_script: VecDeque<bool>,
    registers: HashMap<u16, u16>,
    failing_reads: u32,
    fail_all_reads: bool,
    reject_writes: bool,
    rejected_registers: Vec<u16>,
    writes: Vec<WriteOp>,
}

/// In-memory [`ProtocolConnection`]
#[derive(Debug)]
pub struct MockConnection {
    kind: TransportKind,
    endpoint: String,
    connected: AtomicBool,
    connect_default: AtomicBool,
    connect_delay: Mutex<Duration>,
    state: Mutex<MockState>,
    connect_attempts: AtomicU32,
    disconnects: AtomicU32,
    reads: AtomicU32,
}

impl MockConnection {
    pub fn new(kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            connected: AtomicBool::new(false),
            connect_default: AtomicBool::new(true),
            connect_delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(MockState::default()),
            connect_attempts: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            reads: AtomicU32::new(0),
        }
    }

    /// Results for the next connect attempts, in order. Once exhausted,
    /// the default from [`set_connect_result`](Self::set_connect_result) applies.
    pub fn script_connects(&self, results: &[bool]) -> &Self {
        self.state.lock().connect_script.extend(results.iter().copied());
        self
    }

    pub fn set_connect_result(&self, ok: bool) -> &Self {
        self.connect_default.store(ok, Ordering::SeqCst);
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        *self.connect_delay.lock() = delay;
        self
    }

    pub fn set_register(&self, address: u16, value: u16) -> &Self {
        self.state.lock().registers.insert(address, value);
        self
    }

    pub fn remove_register(&self, address: u16) -> &Self {
        self.state.lock().registers.remove(&address);
        self
    }

    /// The next `n` reads fail
    pub fn fail_next_reads(&self, n: u32) -> &Self {
        self.state.lock().failing_reads = n;
        self
    }

    /// Every read fails until switched off
    pub fn fail_all_reads(&self, fail: bool) -> &Self {
        self.state.lock().fail_all_reads = fail;
        self
    }

    pub fn reject_writes(&self, reject: bool) -> &Self {
        self.state.lock().reject_writes = reject;
        self
    }

    /// Refuse register writes to `address` only
    pub fn reject_register(&self, address: u16) -> &Self {
        self.state.lock().rejected_registers.push(address);
        self
    }

    /// Drop the link without going through `disconnect`, as a peer reset would
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<WriteOp> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    fn record_write(&self, op: WriteOp) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut state = self.state.lock();
        if state.reject_writes {
            return false;
        }
        if let WriteOp::Register { address, .. } = op {
            if state.rejected_registers.contains(&address) {
                return false;
            }
        }
        state.writes.push(op);
        true
    }
}

#[async_trait]
impl ProtocolConnection for MockConnection {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self) -> bool {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.state.lock().connect_script.pop_front();
        let ok = scripted.unwrap_or_else(|| self.connect_default.load(Ordering::SeqCst));
        debug!("mock {} {} connect -> {}", self.kind, self.endpoint, ok);
        self.connected.store(ok, Ordering::SeqCst);
        ok
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(GwSrvError::not_connected());
        }
        let mut state = self.state.lock();
        if state.fail_all_reads {
            return Err(GwSrvError::io(format!("mock read {} failed", address)));
        }
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(GwSrvError::timeout(format!("mock read {} timed out", address)));
        }

        (address..address.saturating_add(count))
            .map(|addr| {
                state
                    .registers
                    .get(&addr)
                    .copied()
                    .ok_or_else(|| GwSrvError::protocol(format!("illegal data address {}", addr)))
            })
            .collect()
    }

    async fn write_register(&self, address: u16, value: u16) -> bool {
        self.record_write(WriteOp::Register { address, value })
    }

    async fn write_coil(&self, address: u16, value: bool) -> bool {
        if self.kind != TransportKind::Logo {
            return false;
        }
        self.record_write(WriteOp::Coil { address, value })
    }
}

/// Factory handing out [`MockConnection`]s.
///
/// Connections queued with [`push`](Self::push) are used first; otherwise a
/// fresh mock that connects successfully is created. Every connection built
/// is kept so tests can inspect it.
#[derive(Debug, Default)]
pub struct MockConnectionFactory {
    queued: Mutex<HashMap<TransportKind, VecDeque<Arc<MockConnection>>>>,
    built: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, conn: Arc<MockConnection>) {
        self.queued
            .lock()
            .entry(conn.kind())
            .or_default()
            .push_back(conn);
    }

    /// All connections built for `kind`, oldest first
    pub fn built(&self, kind: TransportKind) -> Vec<Arc<MockConnection>> {
        self.built
            .lock()
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn latest(&self, kind: TransportKind) -> Option<Arc<MockConnection>> {
        self.built(kind).pop()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn build(&self, kind: TransportKind, config: &ConnectionConfig) -> Option<Arc<dyn ProtocolConnection>> {
        let endpoint = match kind {
            TransportKind::Tcp => config.tcp_endpoint().map(|(h, p)| format!("{}:{}", h, p))?,
            TransportKind::Serial => config
                .serial_endpoint()
                .map(|(port, baud)| format!("{}@{}", port, baud))?,
            TransportKind::Logo => config.logo_endpoint().map(|(h, p)| format!("{}:{}", h, p))?,
        };

        let queued = self.queued.lock().get_mut(&kind).and_then(|q| q.pop_front());
        let conn = queued.unwrap_or_else(|| Arc::new(MockConnection::new(kind, endpoint)));
        self.built.lock().push(Arc::clone(&conn));
        Some(conn)
    }
}
