//! Network B codec: companion-radio event stream
//!
//! Every frame starts with a one-byte code. Responses and pushes from the
//! radio are decoded through an explicit table; any code outside it becomes
//! `ControlFrame::Ignored` so new firmware events are never mistaken for
//! messages.
//!
//! Nodes on this network are addressed by public key. The bridge derives a
//! `u32` node id from the first four key bytes (little-endian) and remembers
//! the six-byte prefix the radio needs to address direct messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::{ControlFrame, Decoded, EncodedFrame, OutboundText, PacketCodec};
use crate::directory::NodeDirectory;
use crate::error::{DecodeError, EncodeError};
use crate::packet::{Network, Packet, PortType, BROADCAST_ID};

/// Largest text accepted by the radio
pub const MAX_TEXT_LEN: usize = 160;

/// Length of the key prefix used to address contacts
pub const PREFIX_LEN: usize = 6;

/// Length of a full public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Host to radio command codes
pub mod command {
    /// Start an app session
    pub const APP_START: u8 = 0x01;
    /// Direct text message
    pub const SEND_TXT_MSG: u8 = 0x02;
    /// Channel text message
    pub const SEND_CHANNEL_TXT_MSG: u8 = 0x03;
    /// Pop the next queued message
    pub const SYNC_NEXT_MESSAGE: u8 = 0x0A;
}

/// Radio to host response and push codes
pub mod response {
    /// Our own identity
    pub const SELF_INFO: u8 = 0x05;
    /// Direct message
    pub const CONTACT_MSG: u8 = 0x07;
    /// Channel message
    pub const CHANNEL_MSG: u8 = 0x08;
    /// Queue drained
    pub const NO_MORE_MESSAGES: u8 = 0x0A;
    /// Direct message with signal metrics
    pub const CONTACT_MSG_V3: u8 = 0x10;
    /// Channel message with signal metrics
    pub const CHANNEL_MSG_V3: u8 = 0x11;
    /// Another node advertised itself
    pub const ADVERT: u8 = 0x80;
    /// Messages are queued on the radio
    pub const MESSAGES_WAITING: u8 = 0x83;
}

const TXT_TYPE_PLAIN: u8 = 0;
const TXT_TYPE_SIGNED: u8 = 2;
const APP_VERSION: u8 = 3;
const APP_NAME: &[u8] = b"duomesh";

/// Node id carried by a public key or key prefix
pub fn node_id_from_key(key: &[u8]) -> u32 {
    let mut id = [0u8; 4];
    let n = key.len().min(4);
    id[..n].copy_from_slice(&key[..n]);
    u32::from_le_bytes(id)
}

/// Stable node id for a channel sender known only by name
pub fn node_id_from_name(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Bounds-checked frame reader
struct FrameReader<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(frame: &'a [u8]) -> Self {
        Self { frame, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.frame.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                got: self.frame.len(),
            });
        }
        let bytes = &self.frame[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.frame[self.pos.min(self.frame.len())..];
        self.pos = self.frame.len();
        bytes
    }
}

/// Message body shared by the v1 and v3 layouts
struct TextBody {
    path_len: u8,
    txt_type: u8,
    text: String,
}

fn read_text_body(reader: &mut FrameReader<'_>) -> Result<TextBody, DecodeError> {
    let path_len = reader.u8()?;
    let txt_type = reader.u8()?;
    let _sender_timestamp = reader.take(4)?;
    if txt_type == TXT_TYPE_SIGNED {
        let _signer_prefix = reader.take(4)?;
    }
    let text = String::from_utf8_lossy(reader.rest()).into_owned();
    Ok(TextBody {
        path_len,
        txt_type,
        text,
    })
}

/// Codec for Network B
pub struct CompanionCodec {
    local_id: AtomicU32,
    contacts: Mutex<HashMap<u32, [u8; PREFIX_LEN]>>,
    directory: Arc<NodeDirectory>,
}

impl CompanionCodec {
    /// Create a codec; `local_id` is learned from the radio when `None`
    pub fn new(local_id: Option<u32>, directory: Arc<NodeDirectory>) -> Self {
        Self {
            local_id: AtomicU32::new(local_id.unwrap_or(0)),
            contacts: Mutex::new(HashMap::new()),
            directory,
        }
    }

    /// Remember how to address a contact
    pub fn learn_contact(&self, key: &[u8]) -> Option<u32> {
        if key.len() < PREFIX_LEN {
            return None;
        }
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&key[..PREFIX_LEN]);
        let id = node_id_from_key(&prefix);
        self.contacts.lock().insert(id, prefix);
        Some(id)
    }

    /// Number of addressable contacts
    pub fn contact_count(&self) -> usize {
        self.contacts.lock().len()
    }

    fn contact_message(&self, frame: &[u8], v3: bool) -> Result<Packet, DecodeError> {
        let mut reader = FrameReader::new(frame);
        reader.take(1)?;
        let snr = if v3 { Self::read_snr(&mut reader)? } else { 0.0 };
        let prefix = reader.take(PREFIX_LEN)?;
        let body = read_text_body(&mut reader)?;

        let from = self
            .learn_contact(prefix)
            .unwrap_or_else(|| node_id_from_key(prefix));
        let to = self.local_node_id().unwrap_or(0);

        Ok(Self::text_packet(frame, from, to, 0, snr, body).build())
    }

    fn channel_message(&self, frame: &[u8], v3: bool) -> Result<Packet, DecodeError> {
        let mut reader = FrameReader::new(frame);
        reader.take(1)?;
        let snr = if v3 { Self::read_snr(&mut reader)? } else { 0.0 };
        let channel = reader.u8()?;
        let mut body = read_text_body(&mut reader)?;

        // channel text arrives as "sender: message"
        let (name, text) = match body.text.split_once(": ") {
            Some((name, text)) => (Some(name.to_string()), text.to_string()),
            None => (None, body.text.clone()),
        };
        body.text = text;
        let from = node_id_from_name(name.as_deref().unwrap_or_default());

        let builder = Self::text_packet(frame, from, BROADCAST_ID, channel, snr, body);
        Ok(match name {
            Some(name) => {
                self.directory.upsert_heard(from, &name, None);
                builder.sender_name(name)
            }
            None => builder,
        }
        .build())
    }

    fn read_snr(reader: &mut FrameReader<'_>) -> Result<f32, DecodeError> {
        let raw = reader.u8()? as i8;
        let _reserved = reader.take(2)?;
        Ok(f32::from(raw) / 4.0)
    }

    fn text_packet(
        frame: &[u8],
        from: u32,
        to: u32,
        channel: u8,
        snr: f32,
        body: TextBody,
    ) -> crate::packet::PacketBuilder {
        // no packet id on this network; derive one from the frame
        let digest = Sha256::digest(frame);
        let id = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let hops = if body.path_len == 0xFF { 0 } else { body.path_len };
        let port = match body.txt_type {
            TXT_TYPE_PLAIN | TXT_TYPE_SIGNED => PortType::Text,
            other => PortType::Unknown(u32::from(other)),
        };

        Packet::builder(Network::B, from, to)
            .id(id)
            .channel(channel)
            .signal(0, snr)
            .hops(0, hops)
            .payload(port, Bytes::from(body.text.into_bytes()))
    }

    fn timestamp() -> [u8; 4] {
        (chrono::Utc::now().timestamp() as u32).to_le_bytes()
    }
}

impl PacketCodec for CompanionCodec {
    fn network(&self) -> Network {
        Network::B
    }

    fn decode(&self, frame: &[u8]) -> Result<Decoded, DecodeError> {
        let code = *frame.first().ok_or(DecodeError::EmptyFrame)?;

        let control = match code {
            response::CONTACT_MSG => return self.contact_message(frame, false).map(Decoded::Packet),
            response::CONTACT_MSG_V3 => {
                return self.contact_message(frame, true).map(Decoded::Packet)
            }
            response::CHANNEL_MSG => return self.channel_message(frame, false).map(Decoded::Packet),
            response::CHANNEL_MSG_V3 => {
                return self.channel_message(frame, true).map(Decoded::Packet)
            }
            response::SELF_INFO => {
                let mut reader = FrameReader::new(frame);
                reader.take(4)?;
                let key = reader.take(PUBLIC_KEY_LEN)?;
                let node_id = node_id_from_key(key);
                self.local_id.store(node_id, Ordering::Relaxed);
                debug!(node_id, "Learned local node id");
                ControlFrame::LocalNode { node_id }
            }
            response::ADVERT => {
                let mut reader = FrameReader::new(frame);
                reader.take(1)?;
                let key = reader.take(PUBLIC_KEY_LEN)?;
                if let Some(id) = self.learn_contact(key) {
                    trace!(node_id = id, known = self.directory.lookup(id).is_some(), "Advert");
                }
                ControlFrame::Ignored {
                    code: u32::from(code),
                }
            }
            response::MESSAGES_WAITING => ControlFrame::MessagesWaiting,
            response::NO_MORE_MESSAGES => ControlFrame::ConfigComplete,
            other => ControlFrame::Ignored {
                code: u32::from(other),
            },
        };
        Ok(Decoded::Control(control))
    }

    fn encode_text(&self, message: &OutboundText) -> Result<EncodedFrame, EncodeError> {
        let text = message.text.as_bytes();
        if text.len() > MAX_TEXT_LEN {
            return Err(EncodeError::TooLarge {
                size: text.len(),
                max: MAX_TEXT_LEN,
            });
        }

        let mut frame = BytesMut::with_capacity(16 + text.len());
        if message.to == BROADCAST_ID {
            frame.put_u8(command::SEND_CHANNEL_TXT_MSG);
            frame.put_u8(TXT_TYPE_PLAIN);
            frame.put_u8(message.channel);
            frame.put_slice(&Self::timestamp());
        } else {
            let prefix = self
                .contacts
                .lock()
                .get(&message.to)
                .copied()
                .ok_or(EncodeError::UnknownContact(message.to))?;
            frame.put_u8(command::SEND_TXT_MSG);
            frame.put_u8(TXT_TYPE_PLAIN);
            frame.put_u8(0); // attempt
            frame.put_slice(&Self::timestamp());
            frame.put_slice(&prefix);
        }
        frame.put_slice(text);

        Ok(EncodedFrame {
            bytes: frame.freeze(),
            packet_id: None,
        })
    }

    fn handshake(&self) -> Vec<Bytes> {
        let mut frame = BytesMut::with_capacity(8 + APP_NAME.len());
        frame.put_u8(command::APP_START);
        frame.put_u8(APP_VERSION);
        frame.put_slice(&[0u8; 6]);
        frame.put_slice(APP_NAME);
        vec![frame.freeze()]
    }

    fn follow_up(&self, decoded: &Decoded) -> Option<Bytes> {
        match decoded {
            Decoded::Packet(_) | Decoded::Control(ControlFrame::MessagesWaiting) => {
                Some(Bytes::from_static(&[command::SYNC_NEXT_MESSAGE]))
            }
            Decoded::Control(_) => None,
        }
    }

    fn local_node_id(&self) -> Option<u32> {
        match self.local_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    fn max_text_len(&self) -> usize {
        MAX_TEXT_LEN
    }
}

impl std::fmt::Debug for CompanionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionCodec")
            .field("local_id", &self.local_node_id())
            .field("contacts", &self.contact_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    fn codec() -> CompanionCodec {
        CompanionCodec::new(Some(0xCAFE_F00D), Arc::new(NodeDirectory::new()))
    }

    fn contact_frame(text: &str) -> Vec<u8> {
        let mut frame = vec![response::CONTACT_MSG];
        frame.extend_from_slice(&PREFIX);
        frame.push(2); // path_len
        frame.push(TXT_TYPE_PLAIN);
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(text.as_bytes());
        frame
    }

    fn channel_frame_v3(channel: u8, text: &str) -> Vec<u8> {
        let mut frame = vec![response::CHANNEL_MSG_V3, 0xF8, 0, 0, channel, 1, TXT_TYPE_PLAIN];
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(text.as_bytes());
        frame
    }

    fn packet(decoded: Decoded) -> Packet {
        match decoded {
            Decoded::Packet(packet) => packet,
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn test_contact_message_is_direct() {
        let codec = codec();
        let packet = packet(codec.decode(&contact_frame("ping")).unwrap());
        assert_eq!(packet.network(), Network::B);
        assert_eq!(packet.from_id(), 0x4433_2211);
        assert_eq!(packet.to_id(), 0xCAFE_F00D);
        assert!(!packet.is_broadcast());
        assert_eq!(packet.text(), Some("ping"));
        assert_eq!(packet.hops_taken(), 2);
        assert_eq!(codec.contact_count(), 1);
    }

    #[test]
    fn test_channel_message_splits_sender_name() {
        let packet = packet(codec().decode(&channel_frame_v3(1, "alice: hello all")).unwrap());
        assert!(packet.is_broadcast());
        assert_eq!(packet.channel_index(), 1);
        assert_eq!(packet.sender_name(), Some("alice"));
        assert_eq!(packet.text(), Some("hello all"));
        assert_eq!(packet.from_id(), node_id_from_name("alice"));
        assert_eq!(packet.snr(), -2.0);
    }

    #[test]
    fn test_same_frame_same_id() {
        let codec = codec();
        let a = packet(codec.decode(&contact_frame("x")).unwrap());
        let b = packet(codec.decode(&contact_frame("x")).unwrap());
        let c = packet(codec.decode(&contact_frame("y")).unwrap());
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_unknown_codes_are_ignored() {
        for code in [0x00u8, 0x06, 0x09, 0x42, 0x81, 0xFE] {
            assert_eq!(
                codec().decode(&[code, 1, 2, 3]).unwrap(),
                Decoded::Control(ControlFrame::Ignored {
                    code: u32::from(code)
                })
            );
        }
    }

    #[test]
    fn test_truncated_message_is_decode_error() {
        let frame = [response::CONTACT_MSG, 0x11, 0x22];
        assert!(matches!(
            codec().decode(&frame),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(codec().decode(&[]), Err(DecodeError::EmptyFrame));
    }

    #[test]
    fn test_self_info_sets_local_id() {
        let codec = CompanionCodec::new(None, Arc::new(NodeDirectory::new()));
        let mut frame = vec![response::SELF_INFO, 1, 20, 22];
        frame.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        frame.extend_from_slice(&[0u8; 28]);
        assert_eq!(
            codec.decode(&frame).unwrap(),
            Decoded::Control(ControlFrame::LocalNode {
                node_id: 0xDDCC_BBAA
            })
        );
        assert_eq!(codec.local_node_id(), Some(0xDDCC_BBAA));
    }

    #[test]
    fn test_follow_up_drains_queue() {
        let codec = codec();
        let waiting = codec.decode(&[response::MESSAGES_WAITING]).unwrap();
        assert_eq!(
            codec.follow_up(&waiting).unwrap().as_ref(),
            &[command::SYNC_NEXT_MESSAGE]
        );

        let message = codec.decode(&contact_frame("hi")).unwrap();
        assert!(codec.follow_up(&message).is_some());

        let done = codec.decode(&[response::NO_MORE_MESSAGES]).unwrap();
        assert!(codec.follow_up(&done).is_none());
    }

    #[test]
    fn test_direct_reply_uses_learned_prefix() {
        let codec = codec();
        let inbound = packet(codec.decode(&contact_frame("hi")).unwrap());

        let frame = codec
            .encode_text(&OutboundText {
                to: inbound.from_id(),
                channel: 0,
                text: "pong".to_string(),
            })
            .unwrap();
        assert_eq!(frame.bytes[0], command::SEND_TXT_MSG);
        assert_eq!(&frame.bytes[7..13], &PREFIX);
        assert_eq!(&frame.bytes[13..], b"pong");
    }

    #[test]
    fn test_direct_to_unknown_contact_fails() {
        let err = codec()
            .encode_text(&OutboundText {
                to: 0x1234_5678,
                channel: 0,
                text: "hello".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, EncodeError::UnknownContact(0x1234_5678));
    }

    #[test]
    fn test_broadcast_encodes_channel_message() {
        let frame = codec()
            .encode_text(&OutboundText {
                to: BROADCAST_ID,
                channel: 2,
                text: "all".to_string(),
            })
            .unwrap();
        assert_eq!(frame.bytes[0], command::SEND_CHANNEL_TXT_MSG);
        assert_eq!(frame.bytes[2], 2);
        assert_eq!(&frame.bytes[7..], b"all");
        assert!(frame.packet_id.is_none());
    }

    #[test]
    fn test_text_limit() {
        let err = codec()
            .encode_text(&OutboundText {
                to: BROADCAST_ID,
                channel: 0,
                text: "x".repeat(MAX_TEXT_LEN + 1),
            })
            .unwrap_err();
        assert!(matches!(err, EncodeError::TooLarge { max: MAX_TEXT_LEN, .. }));
    }

    #[test]
    fn test_handshake_is_app_start() {
        let handshake = codec().handshake();
        assert_eq!(handshake[0][0], command::APP_START);
        assert!(handshake[0].ends_with(APP_NAME));
    }
}
