//! Seams to the business side of the bridge
//!
//! The router pushes every delivered packet into a [`PacketSink`] and,
//! optionally, asks a [`CommandProcessor`] for a reply. Neither sees
//! connection errors: they observe packets or nothing.

use async_trait::async_trait;
use tracing::info;

use crate::packet::{format_node_id, Network, Packet};

/// Append-only packet store
///
/// `record` must not block; the router never waits for a storage ack.
pub trait PacketSink: Send + Sync {
    /// Take ownership of a delivered packet
    fn record(&self, packet: Packet);
}

/// Reply produced by command processing
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Text to send
    pub content: String,
    /// Destination; the inbound packet's sender when `None`
    pub target_id: Option<u32>,
    /// Network override; the inbound packet's network when `None`
    pub network_hint: Option<Network>,
    /// Channel override; the inbound packet's channel when `None`
    pub channel: Option<u8>,
}

impl Reply {
    /// Reply to whoever sent the inbound packet
    pub fn to_sender(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            target_id: None,
            network_hint: None,
            channel: None,
        }
    }

    /// Reply to a specific node
    pub fn to(target_id: u32, content: impl Into<String>) -> Self {
        Self {
            target_id: Some(target_id),
            ..Self::to_sender(content)
        }
    }
}

/// Turns inbound packets into optional replies
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Process one packet
    async fn process(&self, packet: &Packet) -> Option<Reply>;
}

/// Sink that logs each packet at info level
#[derive(Debug, Clone, Default)]
pub struct LoggingSink;

impl PacketSink for LoggingSink {
    fn record(&self, packet: Packet) {
        info!(
            network = %packet.network(),
            from = %format_node_id(packet.from_id()),
            sender = packet.sender_name().unwrap_or("-"),
            channel = packet.channel_index(),
            broadcast = packet.is_broadcast(),
            port = ?packet.port_type(),
            text = packet.text().unwrap_or("<binary>"),
            "Packet received"
        );
    }
}
