//! Frame delimiting for the two radio byte streams
//!
//! - Network A: `0x94 0xC3` + u16 big-endian length + payload, both directions
//! - Network B: `0x3E` + u16 little-endian length + payload from the device,
//!   `0x3C` + u16 little-endian length + payload towards it

use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::config::{COMPANION_INBOUND_START, COMPANION_OUTBOUND_START, MESHTASTIC_MAGIC};
use crate::error::{BridgeError, Result};
use crate::packet::Network;

/// Largest frame body accepted from a radio; anything longer is corrupt
pub const MAX_FRAME_LEN: usize = 512;

/// Wire framing of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Network A length-prefixed protobuf stream
    Meshtastic,
    /// Network B companion event stream
    Companion,
}

impl Framing {
    /// Framing used by a network's radios
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::A => Framing::Meshtastic,
            Network::B => Framing::Companion,
        }
    }

    fn inbound_start(&self) -> &'static [u8] {
        const MESHTASTIC_START: [u8; 2] = MESHTASTIC_MAGIC.to_be_bytes();
        match self {
            Framing::Meshtastic => &MESHTASTIC_START,
            Framing::Companion => &[COMPANION_INBOUND_START],
        }
    }

    fn header_len(&self) -> usize {
        self.inbound_start().len() + 2
    }

    fn body_len(&self, header: &[u8]) -> usize {
        let at = self.inbound_start().len();
        let raw = [header[at], header[at + 1]];
        match self {
            Framing::Meshtastic => u16::from_be_bytes(raw) as usize,
            Framing::Companion => u16::from_le_bytes(raw) as usize,
        }
    }

    /// Wrap an outbound payload in this framing
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(BridgeError::MessageTooLarge {
                size: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let length = payload.len() as u16;
        let mut frame = Vec::with_capacity(4 + payload.len());
        match self {
            Framing::Meshtastic => {
                frame.extend_from_slice(&MESHTASTIC_MAGIC.to_be_bytes());
                frame.extend_from_slice(&length.to_be_bytes());
            }
            Framing::Companion => {
                frame.push(COMPANION_OUTBOUND_START);
                frame.extend_from_slice(&length.to_le_bytes());
            }
        }
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

/// Accumulates stream bytes and yields whole frame bodies
#[derive(Debug)]
pub struct FrameBuffer {
    framing: Framing,
    buffer: BytesMut,
}

impl FrameBuffer {
    /// Empty buffer for a framing
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN * 2),
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered (used when the stream is replaced)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Next complete frame body, resynchronising past garbage
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = self.framing.inbound_start();
        let header_len = self.framing.header_len();

        loop {
            if !self.resync(start) || self.buffer.len() < header_len {
                return None;
            }

            let length = self.framing.body_len(&self.buffer[..header_len]);
            if length > MAX_FRAME_LEN {
                warn!(length, "Frame length too large, likely corrupt");
                // skip this start marker and look for the next one
                self.buffer.advance(1);
                continue;
            }

            let total = header_len + length;
            if self.buffer.len() < total {
                trace!(have = self.buffer.len(), need = total, "Waiting for complete frame");
                return None;
            }

            let mut frame = self.buffer.split_to(total);
            frame.advance(header_len);
            return Some(frame.freeze());
        }
    }

    /// Align the buffer on a start marker; false if none can be present yet
    fn resync(&mut self, start: &[u8]) -> bool {
        if self.buffer.starts_with(start) {
            return true;
        }

        let found = self
            .buffer
            .windows(start.len())
            .position(|window| window == start);

        match found {
            Some(pos) => {
                warn!(discarded = pos, "Discarding bytes before frame start");
                self.buffer.advance(pos);
                true
            }
            None => {
                // a trailing partial marker may complete on the next read
                let keep = if start.len() > 1 && self.buffer.last() == Some(&start[0]) {
                    1
                } else {
                    0
                };
                let discard = self.buffer.len() - keep;
                if discard > 0 {
                    warn!(discarded = discard, "Discarding buffer without frame start");
                    self.buffer.advance(discard);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meshtastic_frame_header() {
        let framed = Framing::Meshtastic.encode(b"hello").unwrap();
        assert_eq!(&framed[..2], &[0x94, 0xC3]);
        assert_eq!(u16::from_be_bytes([framed[2], framed[3]]), 5);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_companion_outbound_header() {
        let framed = Framing::Companion.encode(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(framed[0], 0x3C);
        assert_eq!(u16::from_le_bytes([framed[1], framed[2]]), 3);
        assert_eq!(&framed[3..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            Framing::Meshtastic.encode(&payload),
            Err(BridgeError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_parse_complete_frame() {
        let mut buf = FrameBuffer::new(Framing::Meshtastic);
        buf.extend(&Framing::Meshtastic.encode(b"test").unwrap());
        assert_eq!(buf.next_frame().unwrap().as_ref(), b"test");
        assert_eq!(buf.pending(), 0);
        assert!(buf.next_frame().is_none());
    }

    #[test]
    fn test_parse_partial_frame() {
        let mut buf = FrameBuffer::new(Framing::Meshtastic);
        buf.extend(&[0x94, 0xC3, 0x00, 0x05, b'a']);
        assert!(buf.next_frame().is_none());
        assert_eq!(buf.pending(), 5);

        buf.extend(b"bcde");
        assert_eq!(buf.next_frame().unwrap().as_ref(), b"abcde");
    }

    #[test]
    fn test_skip_garbage_before_magic() {
        let mut buf = FrameBuffer::new(Framing::Meshtastic);
        buf.extend(b"garbage");
        buf.extend(&Framing::Meshtastic.encode(b"test").unwrap());
        assert_eq!(buf.next_frame().unwrap().as_ref(), b"test");
    }

    #[test]
    fn test_trailing_partial_magic_kept() {
        let mut buf = FrameBuffer::new(Framing::Meshtastic);
        buf.extend(b"noise\x94");
        assert!(buf.next_frame().is_none());
        assert_eq!(buf.pending(), 1);
        buf.extend(&[0xC3, 0x00, 0x01, 0x2A]);
        assert_eq!(buf.next_frame().unwrap().as_ref(), &[0x2A]);
    }

    #[test]
    fn test_corrupt_length_skipped() {
        let mut buf = FrameBuffer::new(Framing::Meshtastic);
        buf.extend(&[0x94, 0xC3, 0xFF, 0xFF]);
        buf.extend(&Framing::Meshtastic.encode(b"ok").unwrap());
        assert_eq!(buf.next_frame().unwrap().as_ref(), b"ok");
    }

    #[test]
    fn test_companion_inbound_frames() {
        let mut buf = FrameBuffer::new(Framing::Companion);
        buf.extend(&[0x3E, 0x02, 0x00, 0x0A, 0x0B, 0x3E, 0x01, 0x00, 0x83]);
        assert_eq!(buf.next_frame().unwrap().as_ref(), &[0x0A, 0x0B]);
        assert_eq!(buf.next_frame().unwrap().as_ref(), &[0x83]);
        assert!(buf.next_frame().is_none());
    }
}
