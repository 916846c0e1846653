//! Common packet model shared by both networks
//!
//! Every frame that survives decoding becomes a [`Packet`]. Packets are
//! immutable once built; the only way to change one is to rebuild it, which
//! is what decryption does.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Destination id reserved for "all nodes"
pub const BROADCAST_ID: u32 = 0xFFFF_FFFF;

/// One of the two bridged mesh networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Network A (protobuf over length-prefixed frames)
    A,
    /// Network B (companion event stream)
    B,
}

impl Network {
    /// Both networks, in primary-first order
    pub const ALL: [Network; 2] = [Network::A, Network::B];

    /// The other network
    pub fn other(self) -> Network {
        match self {
            Network::A => Network::B,
            Network::B => Network::A,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::A => write!(f, "network-a"),
            Network::B => write!(f, "network-b"),
        }
    }
}

/// Payload type of a packet
///
/// Closed set with an explicit `Unknown` fallback; unseen codes never
/// masquerade as a concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    /// UTF-8 text message
    Text,
    /// Position report
    Position,
    /// Node identity broadcast
    NodeInfo,
    /// Routing/ack traffic
    Routing,
    /// Device administration
    Admin,
    /// Telemetry readings
    Telemetry,
    /// Route tracing
    TraceRoute,
    /// Neighbor report
    NeighborInfo,
    /// Anything else, with the raw code
    Unknown(u32),
}

impl PortType {
    /// True for human text
    pub fn is_text(&self) -> bool {
        matches!(self, PortType::Text)
    }
}

/// A decoded packet from either network
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    id: u32,
    from_id: u32,
    to_id: u32,
    channel_index: u8,
    port_type: PortType,
    payload: Bytes,
    rssi: i32,
    snr: f32,
    hop_limit: u8,
    hop_start: u8,
    received_at: DateTime<Utc>,
    network: Network,
    encrypted: bool,
    decrypt_failed: bool,
    sender_name: Option<String>,
}

impl Packet {
    /// Start building a packet
    pub fn builder(network: Network, from_id: u32, to_id: u32) -> PacketBuilder {
        PacketBuilder::new(network, from_id, to_id)
    }

    /// Rebuild this packet with changes
    pub fn to_builder(&self) -> PacketBuilder {
        PacketBuilder {
            packet: self.clone(),
        }
    }

    /// Packet identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sender node id
    pub fn from_id(&self) -> u32 {
        self.from_id
    }

    /// Destination node id ([`BROADCAST_ID`] for broadcasts)
    pub fn to_id(&self) -> u32 {
        self.to_id
    }

    /// Channel index
    pub fn channel_index(&self) -> u8 {
        self.channel_index
    }

    /// Payload type
    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    /// Payload bytes; still ciphertext while `encrypted()` is true
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text, if this is a readable text packet
    pub fn text(&self) -> Option<&str> {
        if self.port_type.is_text() && !self.encrypted && !self.decrypt_failed {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }

    /// Received signal strength (dBm), 0 when unknown
    pub fn rssi(&self) -> i32 {
        self.rssi
    }

    /// Signal to noise ratio (dB)
    pub fn snr(&self) -> f32 {
        self.snr
    }

    /// Hops remaining
    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    /// Hop limit at origin
    pub fn hop_start(&self) -> u8 {
        self.hop_start
    }

    /// Hops already travelled
    pub fn hops_taken(&self) -> u8 {
        self.hop_start - self.hop_limit
    }

    /// Receive timestamp
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Network the packet arrived on
    pub fn network(&self) -> Network {
        self.network
    }

    /// Payload is still encrypted
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Decryption was attempted and failed; payload is an opaque placeholder
    pub fn decrypt_failed(&self) -> bool {
        self.decrypt_failed
    }

    /// Display name carried in-band, if the network provides one
    pub fn sender_name(&self) -> Option<&str> {
        self.sender_name.as_deref()
    }

    /// Addressed to every node
    pub fn is_broadcast(&self) -> bool {
        self.to_id == BROADCAST_ID
    }
}

/// Builder enforcing [`Packet`] invariants
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    packet: Packet,
}

impl PacketBuilder {
    fn new(network: Network, from_id: u32, to_id: u32) -> Self {
        Self {
            packet: Packet {
                id: 0,
                from_id,
                to_id,
                channel_index: 0,
                port_type: PortType::Unknown(0),
                payload: Bytes::new(),
                rssi: 0,
                snr: 0.0,
                hop_limit: 0,
                hop_start: 0,
                received_at: Utc::now(),
                network,
                encrypted: false,
                decrypt_failed: false,
                sender_name: None,
            },
        }
    }

    /// Packet id
    pub fn id(mut self, id: u32) -> Self {
        self.packet.id = id;
        self
    }

    /// Channel index
    pub fn channel(mut self, index: u8) -> Self {
        self.packet.channel_index = index;
        self
    }

    /// Port type and payload
    pub fn payload(mut self, port_type: PortType, payload: impl Into<Bytes>) -> Self {
        self.packet.port_type = port_type;
        self.packet.payload = payload.into();
        self
    }

    /// Text payload
    pub fn text(self, text: &str) -> Self {
        self.payload(PortType::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Signal metrics
    pub fn signal(mut self, rssi: i32, snr: f32) -> Self {
        self.packet.rssi = rssi;
        self.packet.snr = snr;
        self
    }

    /// Hop counters
    pub fn hops(mut self, hop_limit: u8, hop_start: u8) -> Self {
        self.packet.hop_limit = hop_limit;
        self.packet.hop_start = hop_start;
        self
    }

    /// Receive timestamp
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.packet.received_at = at;
        self
    }

    /// Encryption flags
    pub fn encryption(mut self, encrypted: bool, decrypt_failed: bool) -> Self {
        self.packet.encrypted = encrypted;
        self.packet.decrypt_failed = decrypt_failed;
        self
    }

    /// In-band sender name
    pub fn sender_name(mut self, name: impl Into<String>) -> Self {
        self.packet.sender_name = Some(name.into());
        self
    }

    /// Finish; older firmware reports hop_start 0, which is clamped up to hop_limit
    pub fn build(mut self) -> Packet {
        if self.packet.hop_start < self.packet.hop_limit {
            self.packet.hop_start = self.packet.hop_limit;
        }
        self.packet
    }
}

/// Format a node id the way operators type it (`!a1b2c3d4`)
pub fn format_node_id(id: u32) -> String {
    format!("!{:08x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_is_derived_from_destination() {
        let bcast = Packet::builder(Network::A, 1, BROADCAST_ID).build();
        let direct = Packet::builder(Network::A, 1, 2).build();
        assert!(bcast.is_broadcast());
        assert!(!direct.is_broadcast());
    }

    #[test]
    fn test_hop_invariant_enforced() {
        let packet = Packet::builder(Network::A, 1, 2).hops(5, 0).build();
        assert!(packet.hop_limit() <= packet.hop_start());
        assert_eq!(packet.hops_taken(), 0);

        let packet = Packet::builder(Network::A, 1, 2).hops(1, 3).build();
        assert_eq!(packet.hops_taken(), 2);
    }

    #[test]
    fn test_text_hidden_while_encrypted() {
        let packet = Packet::builder(Network::A, 1, 2)
            .text("hi")
            .encryption(true, false)
            .build();
        assert!(packet.text().is_none());

        let packet = packet.to_builder().encryption(false, false).build();
        assert_eq!(packet.text(), Some("hi"));
    }

    #[test]
    fn test_network_display() {
        assert_eq!(Network::A.to_string(), "network-a");
        assert_eq!(Network::B.other(), Network::A);
    }

    #[test]
    fn test_format_node_id() {
        assert_eq!(format_node_id(0x0000abcd), "!0000abcd");
    }
}
