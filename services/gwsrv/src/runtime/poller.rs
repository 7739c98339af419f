//! Cyclic register poller

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bus::SignalSink;
use crate::core::register_map::RegisterMap;
use crate::core::signal::{DecodedSignal, RegisterSnapshot, SignalGroup};
use crate::core::transport::{ProtocolConnection, TransportKind};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub interval: Duration,
    /// Consecutive read failures that mean the transport is lost
    pub failure_threshold: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Why a poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    Cancelled,
    /// Failure threshold reached; the connection needs to be re-established
    TransportLost,
}

/// Result of one read pass over all addresses
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Decoded(DecodedSignal),
    TransportLost,
}

pub struct RegisterPoller {
    serial: String,
    conn: Arc<dyn ProtocolConnection>,
    map: Arc<RegisterMap>,
    addresses: Vec<u16>,
    sink: Arc<dyn SignalSink>,
    settings: PollerSettings,
    consecutive_failures: AtomicU32,
    cycles: AtomicU64,
    published: AtomicU64,
}

impl RegisterPoller {
    pub fn new(
        serial: impl Into<String>,
        conn: Arc<dyn ProtocolConnection>,
        map: Arc<RegisterMap>,
        sink: Arc<dyn SignalSink>,
        settings: PollerSettings,
    ) -> Self {
        let addresses = map.addresses();
        Self {
            serial: serial.into(),
            conn,
            map,
            addresses,
            sink,
            settings,
            consecutive_failures: AtomicU32::new(0),
            cycles: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    pub fn group(&self) -> SignalGroup {
        match self.conn.kind() {
            TransportKind::Logo => SignalGroup::Logo,
            TransportKind::Tcp | TransportKind::Serial => SignalGroup::Drive,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Poll until cancelled or the transport is declared lost
    pub async fn run(&self, token: &CancellationToken) -> PollExit {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "Polling {} {} ({} addresses every {:?})",
            self.serial,
            self.conn.kind(),
            self.addresses.len(),
            self.settings.interval
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => return PollExit::Cancelled,
                _ = ticker.tick() => {},
            }

            let outcome = self.read_cycle().await;
            if token.is_cancelled() {
                return PollExit::Cancelled;
            }
            match outcome {
                CycleOutcome::TransportLost => return PollExit::TransportLost,
                CycleOutcome::Decoded(signal) if !signal.is_empty() => {
                    // a stalled sink must not outlive the poller
                    tokio::select! {
                        _ = token.cancelled() => return PollExit::Cancelled,
                        _ = self.emit(&signal) => {},
                    }
                },
                CycleOutcome::Decoded(_) => trace!("nothing decoded"),
            }
        }
    }

    /// Read every address once and decode the snapshot.
    ///
    /// Each failed read bumps the consecutive-failure counter and each
    /// successful one resets it; the threshold is checked after the pass.
    pub async fn read_cycle(&self) -> CycleOutcome {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let mut snapshot = RegisterSnapshot::new();

        for &address in &self.addresses {
            match self.conn.read_holding_registers(address, 1).await {
                Ok(values) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    if let Some(&value) = values.first() {
                        snapshot.insert(address, value);
                    }
                },
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("read {} failed ({} in a row): {}", address, failures, e);
                },
            }
        }

        let failures = self.consecutive_failures();
        if failures >= self.settings.failure_threshold {
            warn!(
                "{}: {} consecutive read failures, transport lost",
                self.conn.endpoint(),
                failures
            );
            return CycleOutcome::TransportLost;
        }

        CycleOutcome::Decoded(self.map.decode(&snapshot))
    }

    async fn emit(&self, signal: &DecodedSignal) {
        match self.sink.publish(&self.serial, self.group(), signal).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => warn!("{} {} publish failed: {}", self.serial, self.group(), e),
        }
    }
}
