//! The dual-network router
//!
//! [`DualNetworkRouter`] owns zero, one or two [`NetworkLink`]s and is the
//! only thing the business side talks to. Frames from every link arrive on
//! one channel and are handled in order by [`DualNetworkRouter::run`]:
//!
//! 1. Decode with the link's codec (malformed frames are dropped)
//! 2. Drop self-broadcast echoes
//! 3. Remember which network the sender was heard on
//! 4. Hand the packet to the sink and, optionally, the command processor
//!
//! Outbound messages go back on the network the target was last heard on.
//! A configured default network is used only for targets never heard
//! from. Sends to a link that is not connected fail immediately; nothing
//! is queued across an outage.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, ControlFrame, Decoded, OutboundText, PacketCodec};
use crate::collaborator::{CommandProcessor, PacketSink, Reply};
use crate::config::{BridgeConfig, NetworkConfig, WatchdogConfig};
use crate::dedup::BroadcastDeduplicator;
use crate::directory::NodeDirectory;
use crate::error::{BridgeError, Result};
use crate::link::{LinkEvent, NetworkLink, EVENT_CHANNEL_CAPACITY};
use crate::packet::{format_node_id, Network, Packet, BROADCAST_ID};
use crate::routing::SenderNetworkMap;
use crate::supervisor::{shutdown_requested, TransportState};
use crate::transport::{self, Framing, Transport};
use crate::watchdog::{
    EscalationMarker, EscalationPolicy, LogOnlyWatchdog, MarkerFileWatchdog, Watchdog,
};

/// Text message to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Message text
    pub content: String,
    /// Destination id, or [`BROADCAST_ID`]
    pub target: u32,
    /// Force a network instead of the sender lookup
    pub network: Option<Network>,
    /// Channel index
    pub channel: u8,
}

impl OutboundMessage {
    /// Direct message to `target` on channel 0
    pub fn new(content: impl Into<String>, target: u32) -> Self {
        Self {
            content: content.into(),
            target,
            network: None,
            channel: 0,
        }
    }

    /// Broadcast on channel 0
    pub fn broadcast(content: impl Into<String>) -> Self {
        Self::new(content, BROADCAST_ID)
    }

    /// Force the network
    pub fn on_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the channel
    pub fn channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

#[derive(Debug, Default)]
struct NetworkCounters {
    frames_received: AtomicU64,
    packets_delivered: AtomicU64,
    decode_errors: AtomicU64,
    decrypt_failures: AtomicU64,
    self_echoes_dropped: AtomicU64,
    packets_sent: AtomicU64,
    send_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Per-network counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Network
    pub network: Network,
    /// Link state, `None` when the link is not running
    pub state: Option<TransportState>,
    /// Successful reconnects
    pub reconnects: u64,
    /// Frames read from the transport
    pub frames_received: u64,
    /// Packets handed to the business side
    pub packets_delivered: u64,
    /// Frames dropped as malformed
    pub decode_errors: u64,
    /// Packets whose payload could not be decrypted
    pub decrypt_failures: u64,
    /// Own broadcasts heard back and dropped
    pub self_echoes_dropped: u64,
    /// Messages written
    pub packets_sent: u64,
    /// Sends refused or failed
    pub send_failures: u64,
}

/// Router statistics snapshot for external monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    /// One entry per network, configured or not
    pub networks: Vec<NetworkStats>,
    /// Replies sent via the default network for cold senders
    pub routing_fallbacks: u64,
    /// Escalations raised
    pub escalations: u64,
    /// Senders with a known network
    pub known_senders: usize,
    /// Recent own broadcasts tracked for echo suppression
    pub tracked_broadcasts: usize,
}

impl RouterStats {
    /// Counters for one network
    pub fn network(&self, network: Network) -> Option<&NetworkStats> {
        self.networks.iter().find(|s| s.network == network)
    }
}

/// Builder for [`DualNetworkRouter`]
pub struct RouterBuilder {
    config: BridgeConfig,
    transports: HashMap<Network, Arc<dyn Transport>>,
    codecs: HashMap<Network, Arc<dyn PacketCodec>>,
    watchdog: Option<Arc<dyn Watchdog>>,
}

impl RouterBuilder {
    /// Start from a configuration
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            transports: HashMap::new(),
            codecs: HashMap::new(),
            watchdog: None,
        }
    }

    /// Use this transport for `network` instead of the configured one
    pub fn transport(mut self, network: Network, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(network, transport);
        self
    }

    /// Use this codec for `network` instead of the default one
    pub fn codec(mut self, network: Network, codec: Arc<dyn PacketCodec>) -> Self {
        self.codecs.insert(network, codec);
        self
    }

    /// Escalation target
    pub fn watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Open every configured link and start their tasks
    ///
    /// Each link gets the full reconnect budget to come up. Failure of the
    /// primary (first configured) network aborts startup. Failure of the
    /// secondary is logged, queued for escalation, and the router carries
    /// on with the primary alone.
    pub async fn start(self) -> Result<Arc<DualNetworkRouter>> {
        let RouterBuilder {
            config,
            mut transports,
            mut codecs,
            watchdog,
        } = self;
        config.validate()?;

        let directory = Arc::new(NodeDirectory::from_known(&config.known_nodes));
        let watchdog = watchdog.unwrap_or_else(|| default_watchdog(&config.watchdog));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let primary = config.primary_network();

        let mut links = BTreeMap::new();
        for network_config in &config.networks {
            let network = network_config.network;
            let link = match open_link(
                network_config,
                transports.remove(&network),
                codecs.remove(&network),
                &directory,
            )
            .await
            {
                Ok(link) => link,
                Err(e) if Some(network) == primary => {
                    error!(network = %network, error = %e, "Primary network failed to start");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        network = %network,
                        error = %e,
                        "Secondary network unavailable, continuing in single-network mode"
                    );
                    // escalated once the consumer runs
                    let failed = LinkEvent::Failed {
                        network,
                        reason: e.to_string(),
                    };
                    if event_tx.try_send(failed).is_err() {
                        trace!(network = %network, "Startup failure not queued");
                    }
                    continue;
                }
            };

            link.wire_inbound(event_tx.clone());
            link.spawn(shutdown_rx.clone());
            links.insert(network, link);
        }

        info!(
            networks = ?links.keys().collect::<Vec<_>>(),
            "Router started"
        );

        Ok(Arc::new(DualNetworkRouter {
            links,
            default_network: config.cold_reply_network(),
            directory,
            dedup: BroadcastDeduplicator::from_config(&config.dedup),
            senders: SenderNetworkMap::new(config.routing.sender_ttl),
            cold_senders: Mutex::new(HashSet::new()),
            counters: [NetworkCounters::default(), NetworkCounters::default()],
            routing_fallbacks: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            watchdog,
            escalation: EscalationPolicy::new(config.watchdog.cooldown),
            component_prefix: config.watchdog.component_prefix.clone(),
            sweep_interval: config.routing.sweep_interval,
            events: Mutex::new(Some(event_rx)),
            shutdown_tx,
        }))
    }
}

fn default_watchdog(config: &WatchdogConfig) -> Arc<dyn Watchdog> {
    match &config.marker_path {
        Some(path) => Arc::new(MarkerFileWatchdog::new(path.clone())),
        None => Arc::new(LogOnlyWatchdog),
    }
}

async fn open_link(
    config: &NetworkConfig,
    transport: Option<Arc<dyn Transport>>,
    codec: Option<Arc<dyn PacketCodec>>,
    directory: &Arc<NodeDirectory>,
) -> Result<Arc<NetworkLink>> {
    let transport = match transport {
        Some(transport) => transport,
        None => transport::from_config(&config.transport, Framing::for_network(config.network))?,
    };
    let codec = match codec {
        Some(codec) => codec,
        None => codec::from_config(config, directory.clone())?,
    };

    let link = NetworkLink::new(
        config.network,
        transport,
        codec,
        config.health.clone(),
        config.reconnect.clone(),
    )?;
    if let Err(e) = link.connect().await {
        link.close().await;
        return Err(e);
    }
    Ok(Arc::new(link))
}

/// Routes packets between two mesh networks and the business side
pub struct DualNetworkRouter {
    links: BTreeMap<Network, Arc<NetworkLink>>,
    default_network: Option<Network>,
    directory: Arc<NodeDirectory>,
    dedup: BroadcastDeduplicator,
    senders: SenderNetworkMap,
    cold_senders: Mutex<HashSet<u32>>,
    counters: [NetworkCounters; 2],
    routing_fallbacks: AtomicU64,
    escalations: AtomicU64,
    watchdog: Arc<dyn Watchdog>,
    escalation: EscalationPolicy,
    component_prefix: String,
    sweep_interval: Duration,
    events: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl DualNetworkRouter {
    /// Builder for a router
    pub fn builder(config: BridgeConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    fn counters(&self, network: Network) -> &NetworkCounters {
        match network {
            Network::A => &self.counters[0],
            Network::B => &self.counters[1],
        }
    }

    /// Networks with a running link
    pub fn active_networks(&self) -> Vec<Network> {
        self.links.keys().copied().collect()
    }

    /// Exactly one link is running
    pub fn is_single_network(&self) -> bool {
        self.links.len() == 1
    }

    /// Link for a network
    pub fn link(&self, network: Network) -> Option<&Arc<NetworkLink>> {
        self.links.get(&network)
    }

    /// State of a network's link
    pub fn link_state(&self, network: Network) -> Option<TransportState> {
        self.links.get(&network).map(|link| link.state())
    }

    /// Whether a network's frames reach the router
    pub fn is_inbound_wired(&self, network: Network) -> bool {
        self.links
            .get(&network)
            .is_some_and(|link| link.is_inbound_wired())
    }

    /// Shared node directory
    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    /// Network a sender was last heard on
    pub fn sender_network(&self, sender: u32) -> Option<Network> {
        self.senders.lookup(sender)
    }

    /// Echo suppression state
    pub fn dedup(&self) -> &BroadcastDeduplicator {
        &self.dedup
    }

    /// Network for targets with no recorded origin
    ///
    /// The configured default when its link is running, else any running
    /// link.
    pub fn cold_reply_network(&self) -> Option<Network> {
        self.default_network
            .filter(|network| self.links.contains_key(network))
            .or_else(|| self.links.keys().next().copied())
    }

    /// Handle one raw frame from `network`
    ///
    /// Returns the packet to deliver, or `None` when the frame was a
    /// control frame, malformed, or an echo of our own broadcast.
    pub async fn on_inbound(&self, raw: &[u8], network: Network) -> Option<Packet> {
        let link = self.links.get(&network)?;
        let counters = self.counters(network);
        bump(&counters.frames_received);

        let decoded = match link.codec().decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                bump(&counters.decode_errors);
                debug!(network = %network, error = %e, len = raw.len(), "Dropping undecodable frame");
                return None;
            }
        };

        if let Some(frame) = link.codec().follow_up(&decoded) {
            if let Err(e) = link.send_frame(&frame).await {
                trace!(network = %network, error = %e, "Follow-up write failed");
            }
        }

        let packet = match decoded {
            Decoded::Packet(packet) => packet,
            Decoded::Control(control) => {
                self.on_control(link, control).await;
                return None;
            }
        };

        if packet.decrypt_failed() {
            bump(&counters.decrypt_failures);
        }

        if self.dedup.is_self_echo(&packet) {
            bump(&counters.self_echoes_dropped);
            return None;
        }

        self.senders.record(packet.from_id(), network, Instant::now());

        let packet = match (packet.sender_name(), self.directory.name_of(packet.from_id())) {
            (None, Some(name)) => packet.to_builder().sender_name(name).build(),
            _ => packet,
        };

        bump(&counters.packets_delivered);
        trace!(
            network = %network,
            from = %format_node_id(packet.from_id()),
            id = packet.id(),
            "Packet delivered"
        );
        Some(packet)
    }

    async fn on_control(&self, link: &NetworkLink, control: ControlFrame) {
        let network = link.network();
        match control {
            ControlFrame::LocalNode { node_id } => {
                info!(network = %network, node = %format_node_id(node_id), "Local node identified");
            }
            ControlFrame::NodeInfo {
                node_id, long_name, ..
            } => {
                debug!(network = %network, node = %format_node_id(node_id), name = %long_name, "Node info");
            }
            ControlFrame::Rebooted => {
                info!(network = %network, "Radio rebooted, resending handshake");
                if let Err(e) = link.send_handshake().await {
                    trace!(network = %network, error = %e, "Handshake after reboot failed");
                }
            }
            ControlFrame::ConfigComplete => debug!(network = %network, "Radio sync complete"),
            ControlFrame::MessagesWaiting => trace!(network = %network, "Messages waiting"),
            ControlFrame::Ignored { code } => trace!(network = %network, code, "Ignored frame"),
        }
    }

    fn resolve_network(&self, target: u32, explicit: Option<Network>) -> Network {
        if let Some(network) = explicit {
            return network;
        }
        if target != BROADCAST_ID {
            if let Some(network) = self.senders.lookup(target) {
                return network;
            }
        }

        let fallback = self
            .cold_reply_network()
            .or(self.default_network)
            .unwrap_or(Network::A);
        if target != BROADCAST_ID {
            bump(&self.routing_fallbacks);
            if self.cold_senders.lock().insert(target) {
                warn!(
                    target = %format_node_id(target),
                    network = %fallback,
                    "No known network for target, using default"
                );
            }
        }
        fallback
    }

    /// Send text to `target`
    ///
    /// The network is `explicit` when given, else where `target` was last
    /// heard, else the default network. Returns the network used.
    pub async fn send(
        &self,
        content: &str,
        target: u32,
        explicit: Option<Network>,
    ) -> Result<Network> {
        self.send_message(OutboundMessage {
            content: content.to_string(),
            target,
            network: explicit,
            channel: 0,
        })
        .await
    }

    /// Send a message; see [`send`](Self::send) for network selection
    pub async fn send_message(&self, message: OutboundMessage) -> Result<Network> {
        let network = self.resolve_network(message.target, message.network);
        let link = self
            .links
            .get(&network)
            .ok_or(BridgeError::NetworkNotConfigured(network))?;
        let counters = self.counters(network);

        let state = link.state();
        if !state.accepts_sends() {
            bump(&counters.send_failures);
            debug!(network = %network, state = %state, "Send refused, link not connected");
            return Err(BridgeError::LinkUnavailable { network, state });
        }

        let frame = link
            .codec()
            .encode_text(&OutboundText {
                to: message.target,
                channel: message.channel,
                text: message.content.clone(),
            })
            .inspect_err(|_| bump(&counters.send_failures))?;

        // recorded before the write so a fast echo still matches
        if message.target == BROADCAST_ID {
            self.dedup
                .on_self_broadcast_sent(network, message.content.as_bytes());
        }

        if let Err(e) = link.send_frame(&frame.bytes).await {
            bump(&counters.send_failures);
            return Err(e);
        }

        bump(&counters.packets_sent);
        debug!(
            network = %network,
            to = %format_node_id(message.target),
            channel = message.channel,
            packet_id = ?frame.packet_id,
            "Message sent"
        );
        Ok(network)
    }

    async fn send_reply(&self, packet: &Packet, reply: Reply) {
        // a reply to a channel message goes back to the channel
        let target = reply.target_id.unwrap_or(if packet.is_broadcast() {
            BROADCAST_ID
        } else {
            packet.from_id()
        });
        let network = reply
            .network_hint
            .or_else(|| reply.target_id.is_none().then(|| packet.network()));

        let message = OutboundMessage {
            content: reply.content,
            target,
            network,
            channel: reply.channel.unwrap_or(packet.channel_index()),
        };
        if let Err(e) = self.send_message(message).await {
            debug!(to = %format_node_id(target), error = %e, "Reply not sent");
        }
    }

    async fn escalate(&self, network: Network, reason: &str) {
        let component = format!("{}.{}", self.component_prefix, network);
        if !self.escalation.try_acquire(&component, Instant::now()) {
            return;
        }
        bump(&self.escalations);

        let marker = EscalationMarker::new(component, reason);
        error!(component = %marker.component, reason, "Escalating to watchdog");
        if let Err(e) = self.watchdog.signal(&marker).await {
            error!(component = %marker.component, error = %e, "Watchdog signal failed");
        }
    }

    /// Evict stale senders and expired broadcast records
    pub fn sweep(&self, now: Instant) {
        let senders = self.senders.sweep(now);
        let broadcasts = self.dedup.purge_expired(now);
        self.cold_senders.lock().clear();
        debug!(senders, broadcasts, "Sweep complete");
    }

    /// Consume link events until shutdown
    ///
    /// Delivered packets go to `sink`, then to `processor` whose reply (if
    /// any) is sent back. Only one consumer may run.
    pub async fn run(
        self: Arc<Self>,
        sink: Arc<dyn PacketSink>,
        processor: Option<Arc<dyn CommandProcessor>>,
    ) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .take()
            .ok_or(BridgeError::AlreadyRunning)?;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut sweep =
            tokio::time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(networks = ?self.active_networks(), "Router running");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(LinkEvent::Frame { network, bytes }) => {
                        let Some(packet) = self.on_inbound(&bytes, network).await else {
                            continue;
                        };
                        sink.record(packet.clone());
                        if let Some(processor) = &processor {
                            if let Some(reply) = processor.process(&packet).await {
                                self.send_reply(&packet, reply).await;
                            }
                        }
                    }
                    Some(LinkEvent::Failed { network, reason }) => {
                        self.escalate(network, &reason).await;
                    }
                    None => {
                        debug!("No links left");
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!("Router stopped");
        Ok(())
    }

    /// Stop every link and the consumer loop
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Router shutting down");

        // unblocks readers waiting on a full channel when run() never started
        self.events.lock().take();
        for link in self.links.values() {
            link.close().await;
        }
        for link in self.links.values() {
            link.join().await;
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> RouterStats {
        let networks = Network::ALL
            .iter()
            .map(|&network| {
                let counters = self.counters(network);
                let link = self.links.get(&network);
                NetworkStats {
                    network,
                    state: link.map(|link| link.state()),
                    reconnects: link.map_or(0, |link| link.supervisor().reconnects()),
                    frames_received: read(&counters.frames_received),
                    packets_delivered: read(&counters.packets_delivered),
                    decode_errors: read(&counters.decode_errors),
                    decrypt_failures: read(&counters.decrypt_failures),
                    self_echoes_dropped: read(&counters.self_echoes_dropped),
                    packets_sent: read(&counters.packets_sent),
                    send_failures: read(&counters.send_failures),
                }
            })
            .collect();

        RouterStats {
            networks,
            routing_fallbacks: read(&self.routing_fallbacks),
            escalations: read(&self.escalations),
            known_senders: self.senders.len(),
            tracked_broadcasts: self.dedup.len(),
        }
    }
}

impl std::fmt::Debug for DualNetworkRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualNetworkRouter")
            .field("links", &self.links)
            .field("default_network", &self.default_network)
            .finish()
    }
}
