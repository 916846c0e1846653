//! Connection health supervision for one transport
//!
//! ```text
//! Connecting -> Connected -> Degraded -> Reconnecting -> Connecting
//!                   ^            |                          |
//!                   +------------+ (packet received)        +-> Failed
//! ```
//!
//! `Failed` is terminal: it is reached on a fatal error or when the
//! reconnect budget is exhausted, and the router escalates from there.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, trace};

use crate::config::{check_health_timing, HealthConfig, ReconnectConfig};
use crate::error::{BridgeError, ErrorClass, Result};
use crate::packet::Network;
use crate::transport::Transport;

/// Link state, owned by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Opening the transport
    Connecting,
    /// Open and delivering
    Connected,
    /// Recoverable trouble seen; sends fail fast until traffic resumes
    Degraded,
    /// Closed and waiting to reopen
    Reconnecting,
    /// Gave up; needs outside intervention
    Failed,
}

impl TransportState {
    /// Sends are accepted only in this state
    pub fn accepts_sends(&self) -> bool {
        matches!(self, TransportState::Connected)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Degraded => write!(f, "degraded"),
            TransportState::Reconnecting => write!(f, "reconnecting"),
            TransportState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a periodic health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Traffic seen within the silence timeout
    Healthy,
    /// No traffic for longer than the silence timeout
    Silent {
        /// Time since the last packet
        elapsed: Duration,
    },
    /// Link is not in a state where silence means anything
    NotApplicable,
}

#[derive(Debug)]
struct SupervisorState {
    state: TransportState,
    last_packet_at: Instant,
    reconnects: u64,
    last_error: Option<String>,
}

/// Wraps one transport with health tracking and reconnect policy
pub struct ConnectionSupervisor {
    network: Network,
    transport: Arc<dyn Transport>,
    health: HealthConfig,
    reconnect: ReconnectConfig,
    inner: Mutex<SupervisorState>,
}

impl ConnectionSupervisor {
    /// Create a supervisor; unsafe health timing is rejected
    pub fn new(
        network: Network,
        transport: Arc<dyn Transport>,
        health: HealthConfig,
        reconnect: ReconnectConfig,
    ) -> Result<Self> {
        check_health_timing(health.check_interval, health.silence_timeout)?;
        Ok(Self {
            network,
            transport,
            health,
            reconnect,
            inner: Mutex::new(SupervisorState {
                state: TransportState::Connecting,
                last_packet_at: Instant::now(),
                reconnects: 0,
                last_error: None,
            }),
        })
    }

    /// Supervised network
    pub fn network(&self) -> Network {
        self.network
    }

    /// Supervised transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Health timing
    pub fn health(&self) -> &HealthConfig {
        &self.health
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    /// When the last packet arrived (or the link last came up)
    pub fn last_packet_at(&self) -> Instant {
        self.inner.lock().last_packet_at
    }

    /// Successful reconnects so far
    pub fn reconnects(&self) -> u64 {
        self.inner.lock().reconnects
    }

    /// Most recent error text
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    fn transition(&self, to: TransportState) -> TransportState {
        let mut inner = self.inner.lock();
        let from = inner.state;
        // Failed is terminal
        if from != TransportState::Failed {
            inner.state = to;
        }
        from
    }

    /// Initial open with the reconnect budget
    ///
    /// Recoverable failures are retried with jittered backoff up to
    /// `max_attempts` opens in total; a fatal error fails at once.
    pub async fn connect(&self) -> Result<()> {
        self.transition(TransportState::Connecting);
        let attempts = self.reconnect.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.transport.open().await {
                Ok(()) => {
                    self.mark_connected(Instant::now());
                    info!(
                        network = %self.network,
                        transport = self.transport.name(),
                        attempt,
                        "Link connected"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt < attempts => {
                    self.inner.lock().last_error = Some(e.to_string());
                    let delay = self.backoff_delay(attempt);
                    trace!(
                        network = %self.network,
                        attempt,
                        ?delay,
                        error = %e,
                        "Open failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.on_error(&e);
                    return Err(e);
                }
            }
        }
        Err(BridgeError::RetriesExhausted { attempts })
    }

    fn mark_connected(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state != TransportState::Failed {
            inner.state = TransportState::Connected;
            // silence is measured from the moment the link came up
            inner.last_packet_at = now;
        }
    }

    /// Record inbound traffic
    pub fn on_packet_received(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.last_packet_at = now;
        if inner.state == TransportState::Degraded {
            inner.state = TransportState::Connected;
            drop(inner);
            info!(network = %self.network, "Link recovered");
        }
    }

    /// Compare elapsed silence with the silence timeout
    ///
    /// Only strictly longer silence counts. Links that are not up (or are
    /// already reconnecting) report `NotApplicable`.
    pub fn periodic_health_check(&self, now: Instant) -> HealthVerdict {
        let inner = self.inner.lock();
        match inner.state {
            TransportState::Connected | TransportState::Degraded => {
                let elapsed = now.saturating_duration_since(inner.last_packet_at);
                if elapsed > self.health.silence_timeout {
                    HealthVerdict::Silent { elapsed }
                } else {
                    HealthVerdict::Healthy
                }
            }
            _ => HealthVerdict::NotApplicable,
        }
    }

    /// Classify an error
    pub fn classify_error(&self, err: &BridgeError) -> ErrorClass {
        err.class()
    }

    /// Apply an error to the state machine
    pub fn on_error(&self, err: &BridgeError) -> ErrorClass {
        let class = self.classify_error(err);
        self.inner.lock().last_error = Some(err.to_string());

        match class {
            ErrorClass::Recoverable => {
                let mut inner = self.inner.lock();
                if matches!(
                    inner.state,
                    TransportState::Connected | TransportState::Connecting
                ) {
                    inner.state = TransportState::Degraded;
                }
                drop(inner);
                trace!(network = %self.network, code = err.error_code(), error = %err, "Recoverable link error");
            }
            ErrorClass::Fatal => {
                self.transition(TransportState::Failed);
                error!(network = %self.network, code = err.error_code(), error = %err, "Link failed");
            }
        }
        class
    }

    /// Close and reopen the transport with jittered backoff
    ///
    /// Ends `Connected` on success. After `max_attempts` failures, or on a
    /// fatal error, the link is `Failed` and the error is returned for
    /// escalation. A shutdown signal aborts the wait between attempts.
    pub async fn on_silence_timeout(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.state() == TransportState::Failed {
            return Err(BridgeError::RetriesExhausted { attempts: 0 });
        }
        self.transition(TransportState::Reconnecting);
        self.transport.close().await;

        let attempts = self.reconnect.max_attempts;
        for attempt in 1..=attempts {
            let delay = self.backoff_delay(attempt);
            trace!(network = %self.network, attempt, ?delay, "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => return Err(BridgeError::ShuttingDown),
            }

            self.transition(TransportState::Connecting);
            match self.transport.open().await {
                Ok(()) => {
                    self.mark_connected(Instant::now());
                    self.inner.lock().reconnects += 1;
                    info!(network = %self.network, attempt, "Link reconnected");
                    return Ok(());
                }
                Err(e) if e.is_retriable() => {
                    self.inner.lock().last_error = Some(e.to_string());
                    self.transition(TransportState::Reconnecting);
                    trace!(network = %self.network, attempt, error = %e, "Reconnect attempt failed");
                }
                Err(e) => {
                    self.on_error(&e);
                    return Err(e);
                }
            }
        }

        self.transition(TransportState::Failed);
        error!(network = %self.network, attempts, "Reconnect budget exhausted");
        Err(BridgeError::RetriesExhausted { attempts })
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .reconnect
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.reconnect.max_delay);

        let jitter = self.reconnect.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("network", &self.network)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Resolve once the shutdown flag is raised (or its sender is gone)
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
