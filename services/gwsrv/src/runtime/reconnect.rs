//! Connection supervision
//!
//! A [`ReconnectSupervisor`] owns the lifecycle of one connection: it retries
//! `connect` at a fixed delay until it succeeds, polls it with a
//! [`RegisterPoller`], and goes back to connecting when the poller reports
//! the transport lost. All of this runs in one task per `start`; only
//! [`stop`](ReconnectSupervisor::stop) ends it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::health::HealthMonitor;
use super::poller::{PollExit, RegisterPoller};
use crate::core::transport::{ProtocolConnection, TransportKind};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Connection state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    /// Connect attempt in progress
    Connecting,
    /// Connected and polling
    Connected,
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconnectStats {
    /// Total connect attempts
    pub connect_attempts: u64,
    /// Successful connects
    pub successful_connects: u64,
    /// Times the poller declared the transport lost
    pub transport_lost: u64,
}

pub struct ReconnectSupervisor {
    serial: String,
    conn: Arc<dyn ProtocolConnection>,
    poller: Arc<RegisterPoller>,
    retry_delay: Duration,
    health: Arc<HealthMonitor>,
    state_tx: watch::Sender<ConnectionState>,
    /// Set between `start` and `stop`
    supervising: AtomicBool,
    token: Mutex<CancellationToken>,
    /// Supervision task of the current or last `start`
    task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes state changes against `stop`
    transition: Mutex<()>,
    stats: Mutex<ReconnectStats>,
    connected_since: Mutex<Option<Instant>>,
}

impl ReconnectSupervisor {
    pub fn new(
        serial: impl Into<String>,
        conn: Arc<dyn ProtocolConnection>,
        poller: RegisterPoller,
        retry_delay: Duration,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            serial: serial.into(),
            conn,
            poller: Arc::new(poller),
            retry_delay,
            health,
            state_tx,
            supervising: AtomicBool::new(false),
            token: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
            transition: Mutex::new(()),
            stats: Mutex::new(ReconnectStats::default()),
            connected_since: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.conn.kind()
    }

    pub fn connection(&self) -> Arc<dyn ProtocolConnection> {
        Arc::clone(&self.conn)
    }

    pub fn poller(&self) -> &RegisterPoller {
        &self.poller
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_supervising(&self) -> bool {
        self.supervising.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats.lock().clone()
    }

    pub fn connected_since(&self) -> Option<Instant> {
        *self.connected_since.lock()
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.connected_since().map(|since| since.elapsed())
    }

    /// Begin supervision. No-op while already supervising.
    ///
    /// A task left over from an earlier `start` is awaited before the new
    /// one touches the connection, so two cycles never overlap.
    pub fn start(self: &Arc<Self>) {
        if self.supervising.swap(true, Ordering::AcqRel) {
            debug!("{} {} already supervised", self.serial, self.kind());
            return;
        }

        let token = {
            let mut token = self.token.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };

        let mut task = self.task.lock();
        let previous = task.take();
        let span = info_span!("link", device = %self.serial, transport = %self.kind());
        *task = Some(tokio::spawn(
            Arc::clone(self).supervise(token, previous).instrument(span),
        ));
    }

    /// End supervision and close the connection.
    ///
    /// Never waits on the supervision task, so it is safe from any context.
    pub async fn stop(&self) {
        let token = self.token.lock().clone();
        token.cancel();
        self.supervising.store(false, Ordering::Release);
        self.conn.disconnect().await;

        let change = {
            let _transition = self.transition.lock();
            *self.connected_since.lock() = None;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            self.health.record(self.kind(), ConnectionState::Disconnected)
        };
        self.health.report(change).await;
        info!("Stopped {} {} supervision", self.serial, self.kind());
    }

    /// Apply a state change unless this run has been cancelled.
    ///
    /// The health change is recorded under the transition lock and reported
    /// after it is released.
    async fn transition_to(&self, token: &CancellationToken, state: ConnectionState) -> bool {
        let change = {
            let _transition = self.transition.lock();
            if token.is_cancelled() {
                return false;
            }
            *self.connected_since.lock() = match state {
                ConnectionState::Connected => Some(Instant::now()),
                _ => None,
            };
            self.state_tx.send_replace(state);
            self.health.record(self.kind(), state)
        };
        self.health.report(change).await;
        true
    }

    /// connect, poll, and reconnect on transport loss until cancelled
    async fn supervise(self: Arc<Self>, token: CancellationToken, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        self.conn.disconnect().await;

        while self.connect(&token).await {
            match self.poller.run(&token).await {
                PollExit::Cancelled => {
                    debug!("poller cancelled");
                    return;
                },
                PollExit::TransportLost => {
                    self.stats.lock().transport_lost += 1;
                    self.conn.disconnect().await;
                    if !self
                        .transition_to(&token, ConnectionState::Disconnected)
                        .await
                    {
                        return;
                    }
                    warn!("transport lost, reconnecting to {}", self.conn.endpoint());
                },
            }
        }
    }

    /// Retry `connect` at the fixed delay. False once cancelled.
    async fn connect(&self, token: &CancellationToken) -> bool {
        loop {
            if !self.transition_to(token, ConnectionState::Connecting).await {
                return false;
            }
            self.stats.lock().connect_attempts += 1;

            let connected = tokio::select! {
                _ = token.cancelled() => false,
                ok = self.conn.connect() => ok,
            };

            if connected {
                if !self.transition_to(token, ConnectionState::Connected).await {
                    self.conn.disconnect().await;
                    return false;
                }
                self.stats.lock().successful_connects += 1;
                info!("connected to {}", self.conn.endpoint());
                return true;
            }

            if !self.transition_to(token, ConnectionState::Disconnected).await {
                return false;
            }
            debug!(
                "connect to {} failed, retry in {:?}",
                self.conn.endpoint(),
                self.retry_delay
            );
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_delay) => {},
            }
        }
    }
}
