//! Wire-frame codecs for the two networks
//!
//! A [`PacketCodec`] turns one frame body (already delimited by the
//! transport) into a [`Packet`] or a [`ControlFrame`], and turns outbound
//! text into a frame body. Codecs also own the small amount of link
//! protocol each radio expects: the handshake sent on every (re)connect,
//! keepalives, and follow-up requests that drain the radio's queue.

pub mod companion;
pub mod crypto;
pub mod meshtastic;

pub use companion::CompanionCodec;
pub use crypto::{ChannelKey, ChannelKeys};
pub use meshtastic::MeshtasticCodec;

use std::sync::Arc;

use bytes::Bytes;

use crate::config::NetworkConfig;
use crate::directory::{parse_node_id, NodeDirectory};
use crate::error::{BridgeError, DecodeError, EncodeError, Result};
use crate::packet::{Network, Packet};

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A mesh packet for the router
    Packet(Packet),
    /// Link-level information consumed inside the bridge
    Control(ControlFrame),
}

/// Non-packet frames
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    /// The radio reported our own node id
    LocalNode {
        /// Our node id
        node_id: u32,
    },
    /// Identity of another node
    NodeInfo {
        /// Node id
        node_id: u32,
        /// Display name
        long_name: String,
        /// Short name, if any
        short_name: Option<String>,
    },
    /// The radio holds queued messages
    MessagesWaiting,
    /// The radio finished replaying its configuration / queue
    ConfigComplete,
    /// The radio restarted
    Rebooted,
    /// Recognised but irrelevant frame
    Ignored {
        /// Frame type code
        code: u32,
    },
}

/// Text to put on the air
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundText {
    /// Destination id ([`BROADCAST_ID`](crate::packet::BROADCAST_ID) for everyone)
    pub to: u32,
    /// Channel index
    pub channel: u8,
    /// Message text
    pub text: String,
}

/// Encoded outbound frame body
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    /// Frame body (unframed)
    pub bytes: Bytes,
    /// Packet id assigned on the air, when the network has one
    pub packet_id: Option<u32>,
}

/// Translates between one network's frames and the common packet model
pub trait PacketCodec: Send + Sync {
    /// Network served by this codec
    fn network(&self) -> Network;

    /// Decode one frame body
    ///
    /// Unknown payload types decode as `PortType::Unknown` rather than
    /// failing the frame.
    fn decode(&self, frame: &[u8]) -> std::result::Result<Decoded, DecodeError>;

    /// Encode a text message
    fn encode_text(&self, message: &OutboundText) -> std::result::Result<EncodedFrame, EncodeError>;

    /// Frames to send after every (re)connect
    fn handshake(&self) -> Vec<Bytes>;

    /// Keepalive frame, if the radio expects one
    fn keepalive(&self) -> Option<Bytes> {
        None
    }

    /// Frame to send in response to a decoded frame
    fn follow_up(&self, _decoded: &Decoded) -> Option<Bytes> {
        None
    }

    /// Our node id on this network, once known
    fn local_node_id(&self) -> Option<u32>;

    /// Largest text payload in bytes
    fn max_text_len(&self) -> usize;
}

/// Build the codec for a configured network
pub fn from_config(
    config: &NetworkConfig,
    directory: Arc<NodeDirectory>,
) -> Result<Arc<dyn PacketCodec>> {
    let local_id = match &config.node_id {
        Some(raw) => Some(parse_node_id(raw).into_iter().next().ok_or_else(|| {
            BridgeError::InvalidConfig(format!("{}: bad node_id {:?}", config.network, raw))
        })?),
        None => None,
    };

    match config.network {
        Network::A => {
            let keys = ChannelKeys::from_config(&config.channel_keys)?;
            Ok(Arc::new(MeshtasticCodec::new(keys, local_id, directory).with_hop_limit(config.max_hops)))
        }
        Network::B => Ok(Arc::new(CompanionCodec::new(local_id, directory))),
    }
}
