//! One live radio link: transport, codec and supervisor
//!
//! Each link runs two tasks. The reader pulls frames off the transport and
//! forwards them to the router as [`LinkEvent`]s, so a stalled radio never
//! blocks the other network. The health task runs the periodic silence
//! check and sends keepalives.
//!
//! Reconnects are driven from the reader only. When the health task sees
//! silence it closes the transport, the reader's pending read returns
//! `Closed`, and the reader runs the supervisor's reconnect sequence.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::codec::PacketCodec;
use crate::config::{HealthConfig, ReconnectConfig, IDLE_BACKOFF};
use crate::error::{BridgeError, ErrorClass, Result};
use crate::packet::Network;
use crate::supervisor::{shutdown_requested, ConnectionSupervisor, HealthVerdict, TransportState};
use crate::transport::Transport;

/// Capacity of the reader-to-router channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event sent from a link's reader to the router
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One frame body, not yet decoded
    Frame {
        /// Source network
        network: Network,
        /// Frame body
        bytes: Bytes,
    },
    /// The link is down for good and needs escalation
    Failed {
        /// Failed network
        network: Network,
        /// Cause
        reason: String,
    },
}

/// Transport, codec and supervisor for one network
pub struct NetworkLink {
    network: Network,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PacketCodec>,
    supervisor: ConnectionSupervisor,
    inbound: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkLink {
    /// Assemble a link; rejects unsafe health timing
    pub fn new(
        network: Network,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PacketCodec>,
        health: HealthConfig,
        reconnect: ReconnectConfig,
    ) -> Result<Self> {
        let supervisor = ConnectionSupervisor::new(network, transport.clone(), health, reconnect)?;
        Ok(Self {
            network,
            transport,
            codec,
            supervisor,
            inbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Network served
    pub fn network(&self) -> Network {
        self.network
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Codec
    pub fn codec(&self) -> &Arc<dyn PacketCodec> {
        &self.codec
    }

    /// Supervisor
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Current supervisor state
    pub fn state(&self) -> TransportState {
        self.supervisor.state()
    }

    /// Route inbound frames to `tx`
    pub fn wire_inbound(&self, tx: mpsc::Sender<LinkEvent>) {
        *self.inbound.lock() = Some(tx);
    }

    /// Whether inbound frames have somewhere to go
    pub fn is_inbound_wired(&self) -> bool {
        self.inbound
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Open the transport and greet the radio
    pub async fn connect(&self) -> Result<()> {
        self.supervisor.connect().await?;
        self.send_handshake().await
    }

    /// Send the codec's handshake frames
    pub async fn send_handshake(&self) -> Result<()> {
        for frame in self.codec.handshake() {
            self.send_frame(&frame).await?;
        }
        trace!(network = %self.network, "Handshake sent");
        Ok(())
    }

    /// Write one frame body; failures feed the supervisor
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        match self.transport.write(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.supervisor.on_error(&e);
                Err(e)
            }
        }
    }

    /// Spawn the reader and health tasks
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let reader = tokio::spawn(self.clone().reader_loop(shutdown.clone()));
        let health = tokio::spawn(self.clone().health_loop(shutdown));
        self.tasks.lock().extend([reader, health]);
    }

    /// Close the transport, which also wakes the reader
    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// Wait for the link's tasks to finish
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(network = %self.network, error = %e, "Link task ended abnormally");
            }
        }
    }

    async fn deliver(&self, event: LinkEvent) -> bool {
        let tx = self.inbound.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => {
                debug!(network = %self.network, "Inbound not wired, dropping event");
                true
            }
        }
    }

    async fn report_failure(&self, reason: String) {
        error!(network = %self.network, reason = %reason, "Link failed, requesting escalation");
        self.deliver(LinkEvent::Failed {
            network: self.network,
            reason,
        })
        .await;
    }

    async fn reader_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let read_timeout = self.supervisor.health().read_timeout;
        debug!(network = %self.network, "Reader started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = self.transport.read_frame(read_timeout).await;

            // shutdown is only observed between frames
            if *shutdown.borrow() {
                break;
            }

            match result {
                Ok(Some(bytes)) => {
                    self.supervisor.on_packet_received(Instant::now());
                    let event = LinkEvent::Frame {
                        network: self.network,
                        bytes,
                    };
                    if !self.deliver(event).await {
                        debug!(network = %self.network, "Router gone, reader stopping");
                        break;
                    }
                }
                Ok(None) => tokio::time::sleep(IDLE_BACKOFF).await,
                Err(e) => {
                    if self.supervisor.on_error(&e) == ErrorClass::Fatal {
                        self.report_failure(e.to_string()).await;
                        break;
                    }
                    match self.supervisor.on_silence_timeout(shutdown.clone()).await {
                        Ok(()) => {
                            if let Err(e) = self.send_handshake().await {
                                trace!(network = %self.network, error = %e, "Handshake after reconnect failed");
                            }
                        }
                        Err(BridgeError::ShuttingDown) => break,
                        Err(e) => {
                            self.report_failure(e.to_string()).await;
                            break;
                        }
                    }
                }
            }
        }

        debug!(network = %self.network, "Reader stopped");
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let health = self.supervisor.health().clone();
        let mut ticker =
            tokio::time::interval_at(Instant::now() + health.check_interval, health.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_keepalive = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            let now = Instant::now();
            match self.supervisor.periodic_health_check(now) {
                HealthVerdict::Silent { elapsed } => {
                    info!(network = %self.network, ?elapsed, "Link silent, forcing reconnect");
                    self.transport.close().await;
                }
                HealthVerdict::Healthy => {
                    if now.saturating_duration_since(last_keepalive) >= health.keepalive_interval {
                        if let Some(frame) = self.codec.keepalive() {
                            if let Err(e) = self.send_frame(&frame).await {
                                trace!(network = %self.network, error = %e, "Keepalive failed");
                            }
                        }
                        last_keepalive = now;
                    }
                }
                HealthVerdict::NotApplicable => {
                    if self.supervisor.state() == TransportState::Failed {
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for NetworkLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkLink")
            .field("network", &self.network)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .field("inbound_wired", &self.is_inbound_wired())
            .finish()
    }
}
