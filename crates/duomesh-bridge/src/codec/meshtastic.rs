//! Network A codec: protobuf frames from a Meshtastic-style radio
//!
//! The radio streams `FromRadio` messages and accepts `ToRadio` messages.
//! Only the fields the bridge reads are declared; prost skips the rest.
//!
//! # Decryption
//!
//! A packet the radio could not decrypt itself arrives with an
//! `encrypted` payload. The bridge decrypts it only when it is addressed to
//! our own node id; anything else stays opaque.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use prost::Message;
use tracing::{debug, trace};

use super::crypto::ChannelKeys;
use super::{ControlFrame, Decoded, EncodedFrame, OutboundText, PacketCodec};
use crate::config::{DEFAULT_MAX_HOPS, LORA_MAX_PAYLOAD, MAX_HOP_LIMIT};
use crate::directory::NodeDirectory;
use crate::error::{DecodeError, EncodeError};
use crate::packet::{Network, Packet, PortType, BROADCAST_ID};

/// Payload exposed when decryption fails
pub const DECRYPT_FAILED_PLACEHOLDER: &[u8] = b"<encrypted>";

/// Wire messages (subset of the radio's protobuf schema)
#[allow(missing_docs)]
pub mod proto {
    /// Message from the radio to the host
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FromRadio {
        #[prost(uint32, tag = "1")]
        pub id: u32,
        #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 7, 8")]
        pub payload_variant: Option<from_radio::PayloadVariant>,
    }

    pub mod from_radio {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum PayloadVariant {
            #[prost(message, tag = "2")]
            Packet(super::MeshPacket),
            #[prost(message, tag = "3")]
            MyInfo(super::MyNodeInfo),
            #[prost(message, tag = "4")]
            NodeInfo(super::NodeInfo),
            #[prost(uint32, tag = "7")]
            ConfigCompleteId(u32),
            #[prost(bool, tag = "8")]
            Rebooted(bool),
        }
    }

    /// Message from the host to the radio
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ToRadio {
        #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
        pub payload_variant: Option<to_radio::PayloadVariant>,
    }

    pub mod to_radio {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum PayloadVariant {
            #[prost(message, tag = "1")]
            Packet(super::MeshPacket),
            #[prost(uint32, tag = "3")]
            WantConfigId(u32),
            #[prost(bool, tag = "4")]
            Disconnect(bool),
            #[prost(message, tag = "7")]
            Heartbeat(super::Heartbeat),
        }
    }

    /// A packet on the mesh
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MeshPacket {
        #[prost(fixed32, tag = "1")]
        pub from: u32,
        #[prost(fixed32, tag = "2")]
        pub to: u32,
        #[prost(uint32, tag = "3")]
        pub channel: u32,
        #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
        pub payload_variant: Option<mesh_packet::PayloadVariant>,
        #[prost(fixed32, tag = "6")]
        pub id: u32,
        #[prost(fixed32, tag = "7")]
        pub rx_time: u32,
        #[prost(float, tag = "8")]
        pub rx_snr: f32,
        #[prost(uint32, tag = "9")]
        pub hop_limit: u32,
        #[prost(bool, tag = "10")]
        pub want_ack: bool,
        #[prost(int32, tag = "12")]
        pub rx_rssi: i32,
        #[prost(uint32, tag = "15")]
        pub hop_start: u32,
    }

    pub mod mesh_packet {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum PayloadVariant {
            #[prost(message, tag = "4")]
            Decoded(super::Data),
            #[prost(bytes = "vec", tag = "5")]
            Encrypted(Vec<u8>),
        }
    }

    /// Decoded packet payload
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Data {
        #[prost(int32, tag = "1")]
        pub portnum: i32,
        #[prost(bytes = "vec", tag = "2")]
        pub payload: Vec<u8>,
        #[prost(bool, tag = "3")]
        pub want_response: bool,
        #[prost(fixed32, tag = "4")]
        pub dest: u32,
        #[prost(fixed32, tag = "5")]
        pub source: u32,
        #[prost(fixed32, tag = "6")]
        pub request_id: u32,
        #[prost(fixed32, tag = "7")]
        pub reply_id: u32,
        #[prost(fixed32, tag = "8")]
        pub emoji: u32,
        #[prost(uint32, optional, tag = "9")]
        pub bitfield: Option<u32>,
    }

    /// The radio's own identity
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MyNodeInfo {
        #[prost(uint32, tag = "1")]
        pub my_node_num: u32,
    }

    /// Another node's identity
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NodeInfo {
        #[prost(uint32, tag = "1")]
        pub num: u32,
        #[prost(message, optional, tag = "2")]
        pub user: Option<User>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct User {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub long_name: String,
        #[prost(string, tag = "3")]
        pub short_name: String,
    }

    /// Keepalive
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Heartbeat {}
}

use proto::{from_radio, mesh_packet, to_radio};

/// Port number of text messages
pub const PORT_TEXT: i32 = 1;

/// Map a port number to a payload type
pub fn port_type(portnum: i32) -> PortType {
    match portnum {
        1 => PortType::Text,
        3 => PortType::Position,
        4 => PortType::NodeInfo,
        5 => PortType::Routing,
        6 => PortType::Admin,
        67 => PortType::Telemetry,
        70 => PortType::TraceRoute,
        71 => PortType::NeighborInfo,
        other => PortType::Unknown(other as u32),
    }
}

/// Decrypt a packet addressed to us
///
/// Only packets that are still encrypted and addressed to `our_id` are
/// touched. Failure never errors: the packet comes back flagged
/// `decrypt_failed` with an opaque placeholder payload.
pub fn decrypt(packet: Packet, keys: &ChannelKeys, our_id: Option<u32>) -> Packet {
    if !packet.encrypted() || our_id != Some(packet.to_id()) {
        return packet;
    }

    let data = keys
        .decrypt(
            packet.channel_index(),
            packet.id(),
            packet.from_id(),
            packet.payload(),
        )
        .and_then(|plain| parse_plain_data(&plain));

    match data {
        Some(data) => {
            trace!(id = packet.id(), from = packet.from_id(), "Decrypted direct message");
            packet
                .to_builder()
                .payload(port_type(data.portnum), data.payload)
                .encryption(false, false)
                .build()
        }
        None => {
            debug!(id = packet.id(), from = packet.from_id(), "Direct message failed to decrypt");
            packet
                .to_builder()
                .payload(
                    PortType::Unknown(0),
                    Bytes::from_static(DECRYPT_FAILED_PLACEHOLDER),
                )
                .encryption(true, true)
                .build()
        }
    }
}

/// Wire type `Data` declares for a field number
fn data_wire_type(field: u64) -> Option<u64> {
    match field {
        1 | 3 | 9 => Some(0),
        2 => Some(2),
        4..=8 => Some(5),
        _ => None,
    }
}

fn read_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = buf.split_first()?;
        *buf = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// Every field is one `Data` declares, with its declared wire type
fn has_only_data_fields(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let Some(key) = read_varint(&mut buf) else {
            return false;
        };
        let wire_type = key & 0x7;
        if data_wire_type(key >> 3) != Some(wire_type) {
            return false;
        }
        let skip = match wire_type {
            0 => match read_varint(&mut buf) {
                Some(_) => 0,
                None => return false,
            },
            2 => match read_varint(&mut buf).and_then(|len| usize::try_from(len).ok()) {
                Some(len) => len,
                None => return false,
            },
            _ => 4,
        };
        if buf.len() < skip {
            return false;
        }
        buf = &buf[skip..];
    }
    true
}

/// A wrong key yields noise; accept only a structurally valid `Data`
fn parse_plain_data(plain: &[u8]) -> Option<proto::Data> {
    if !has_only_data_fields(plain) {
        return None;
    }
    let data = proto::Data::decode(plain).ok()?;
    let known_port = !matches!(port_type(data.portnum), PortType::Unknown(_));
    if data.portnum <= 0 || !(known_port || !data.payload.is_empty()) {
        return None;
    }
    Some(data)
}

/// Codec for Network A
pub struct MeshtasticCodec {
    keys: ChannelKeys,
    local_id: AtomicU32,
    hop_limit: u8,
    directory: Arc<NodeDirectory>,
}

impl MeshtasticCodec {
    /// Create a codec; `local_id` is learned from the radio when `None`
    pub fn new(keys: ChannelKeys, local_id: Option<u32>, directory: Arc<NodeDirectory>) -> Self {
        Self {
            keys,
            local_id: AtomicU32::new(local_id.unwrap_or(0)),
            hop_limit: DEFAULT_MAX_HOPS,
            directory,
        }
    }

    /// Hop limit for outgoing packets
    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit.min(MAX_HOP_LIMIT);
        self
    }

    fn packet_from_wire(&self, wire: proto::MeshPacket) -> Result<Packet, DecodeError> {
        let channel = u8::try_from(wire.channel)
            .map_err(|_| DecodeError::InvalidField(format!("channel {}", wire.channel)))?;
        let received_at = match wire.rx_time {
            0 => Utc::now(),
            secs => Utc
                .timestamp_opt(i64::from(secs), 0)
                .single()
                .unwrap_or_else(Utc::now),
        };
        let hop_limit = wire.hop_limit.min(u32::from(MAX_HOP_LIMIT)) as u8;
        let hop_start = wire.hop_start.min(u32::from(MAX_HOP_LIMIT)) as u8;

        let builder = Packet::builder(Network::A, wire.from, wire.to)
            .id(wire.id)
            .channel(channel)
            .signal(wire.rx_rssi, wire.rx_snr)
            .hops(hop_limit, hop_start)
            .received_at(received_at);

        let packet = match wire.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => builder
                .payload(port_type(data.portnum), data.payload)
                .build(),
            Some(mesh_packet::PayloadVariant::Encrypted(ciphertext)) => builder
                .payload(PortType::Unknown(0), ciphertext)
                .encryption(true, false)
                .build(),
            None => builder.build(),
        };

        Ok(decrypt(packet, &self.keys, self.local_node_id()))
    }

    fn to_radio(variant: to_radio::PayloadVariant) -> Bytes {
        let message = proto::ToRadio {
            payload_variant: Some(variant),
        };
        Bytes::from(message.encode_to_vec())
    }
}

impl PacketCodec for MeshtasticCodec {
    fn network(&self) -> Network {
        Network::A
    }

    fn decode(&self, frame: &[u8]) -> Result<Decoded, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::EmptyFrame);
        }

        let message = proto::FromRadio::decode(frame)?;
        let control = match message.payload_variant {
            Some(from_radio::PayloadVariant::Packet(wire)) => {
                return self.packet_from_wire(wire).map(Decoded::Packet);
            }
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                self.local_id.store(info.my_node_num, Ordering::Relaxed);
                ControlFrame::LocalNode {
                    node_id: info.my_node_num,
                }
            }
            Some(from_radio::PayloadVariant::NodeInfo(info)) => {
                let user = info.user.unwrap_or_default();
                let short_name = (!user.short_name.is_empty()).then_some(user.short_name);
                if !user.long_name.is_empty() {
                    self.directory
                        .upsert_heard(info.num, &user.long_name, short_name.as_deref());
                }
                ControlFrame::NodeInfo {
                    node_id: info.num,
                    long_name: user.long_name,
                    short_name,
                }
            }
            Some(from_radio::PayloadVariant::ConfigCompleteId(_)) => ControlFrame::ConfigComplete,
            Some(from_radio::PayloadVariant::Rebooted(_)) => ControlFrame::Rebooted,
            None => ControlFrame::Ignored { code: 0 },
        };
        Ok(Decoded::Control(control))
    }

    fn encode_text(&self, message: &OutboundText) -> Result<EncodedFrame, EncodeError> {
        let size = message.text.len();
        if size > LORA_MAX_PAYLOAD {
            return Err(EncodeError::TooLarge {
                size,
                max: LORA_MAX_PAYLOAD,
            });
        }

        let packet_id = loop {
            let id: u32 = rand::random();
            if id != 0 {
                break id;
            }
        };

        let packet = proto::MeshPacket {
            to: message.to,
            channel: u32::from(message.channel),
            id: packet_id,
            hop_limit: u32::from(self.hop_limit),
            want_ack: message.to != BROADCAST_ID,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: PORT_TEXT,
                payload: message.text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };

        Ok(EncodedFrame {
            bytes: Self::to_radio(to_radio::PayloadVariant::Packet(packet)),
            packet_id: Some(packet_id),
        })
    }

    fn handshake(&self) -> Vec<Bytes> {
        let config_id: u32 = rand::random();
        vec![Self::to_radio(to_radio::PayloadVariant::WantConfigId(config_id))]
    }

    fn keepalive(&self) -> Option<Bytes> {
        Some(Self::to_radio(to_radio::PayloadVariant::Heartbeat(
            proto::Heartbeat {},
        )))
    }

    fn local_node_id(&self) -> Option<u32> {
        match self.local_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    fn max_text_len(&self) -> usize {
        LORA_MAX_PAYLOAD
    }
}

impl std::fmt::Debug for MeshtasticCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshtasticCodec")
            .field("local_id", &self.local_node_id())
            .field("hop_limit", &self.hop_limit)
            .finish()
    }
}
