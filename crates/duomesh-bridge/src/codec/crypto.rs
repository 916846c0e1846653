//! Channel PSKs and AES-CTR payload encryption
//!
//! Network A encrypts payloads with AES in counter mode. The 16-byte
//! counter block is the packet id as u64 little-endian, then the sender id
//! as u32 little-endian, then four zero bytes. Encryption and decryption are
//! the same keystream operation.

use std::collections::BTreeMap;
use std::fmt;

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::{BridgeError, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Well-known key selected by the 1-byte PSK shorthand
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// One channel's symmetric key
#[derive(Clone, PartialEq, Eq)]
pub enum ChannelKey {
    /// 16-byte PSK
    Aes128([u8; 16]),
    /// 32-byte PSK
    Aes256([u8; 32]),
}

impl ChannelKey {
    /// Parse a configured key
    ///
    /// Accepts hex (32 or 64 digits, optional `0x`), `default`, the shorthand
    /// indices `1`..`10`, and `none`/empty for an unencrypted channel.
    pub fn parse(value: &str) -> Result<Option<Self>> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "none" | "0" => return Ok(None),
            "default" => return Ok(Some(ChannelKey::Aes128(DEFAULT_PSK))),
            _ => {}
        }

        if value.len() <= 2 {
            if let Ok(index) = value.parse::<u8>() {
                return Self::from_psk_bytes(&[index]);
            }
        }

        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        let bytes = hex::decode(digits)
            .map_err(|e| BridgeError::InvalidConfig(format!("channel key: {}", e)))?;
        Self::from_psk_bytes(&bytes)
    }

    /// Interpret raw PSK bytes as stored on the radio
    pub fn from_psk_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        match bytes.len() {
            0 => Ok(None),
            1 => match bytes[0] {
                0 => Ok(None),
                index @ 1..=10 => {
                    let mut key = DEFAULT_PSK;
                    key[15] = key[15].wrapping_add(index - 1);
                    Ok(Some(ChannelKey::Aes128(key)))
                }
                other => Err(BridgeError::InvalidConfig(format!(
                    "channel key shorthand {} out of range 1..=10",
                    other
                ))),
            },
            16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(bytes);
                Ok(Some(ChannelKey::Aes128(key)))
            }
            32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(bytes);
                Ok(Some(ChannelKey::Aes256(key)))
            }
            n => Err(BridgeError::InvalidConfig(format!(
                "channel key must be 16 or 32 bytes, got {}",
                n
            ))),
        }
    }

    /// XOR `buf` with the keystream for one packet
    pub fn apply_keystream(&self, packet_id: u32, from: u32, buf: &mut [u8]) {
        let iv = nonce(packet_id, from);
        match self {
            ChannelKey::Aes128(key) => {
                Aes128Ctr::new(key.into(), (&iv).into()).apply_keystream(buf)
            }
            ChannelKey::Aes256(key) => {
                Aes256Ctr::new(key.into(), (&iv).into()).apply_keystream(buf)
            }
        }
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log key material
        match self {
            ChannelKey::Aes128(_) => write!(f, "ChannelKey::Aes128(..)"),
            ChannelKey::Aes256(_) => write!(f, "ChannelKey::Aes256(..)"),
        }
    }
}

/// Counter block for a packet
pub fn nonce(packet_id: u32, from: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    iv[8..12].copy_from_slice(&from.to_le_bytes());
    iv
}

/// Keys for every configured channel, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct ChannelKeys {
    keys: BTreeMap<u8, ChannelKey>,
}

impl ChannelKeys {
    /// Parse the configured `index -> key` map
    pub fn from_config(config: &BTreeMap<u8, String>) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for (index, value) in config {
            let key = ChannelKey::parse(value).map_err(|e| {
                BridgeError::InvalidConfig(format!("channel {}: {}", index, e))
            })?;
            if let Some(key) = key {
                keys.insert(*index, key);
            }
        }
        Ok(Self { keys })
    }

    /// Add a key
    pub fn insert(&mut self, index: u8, key: ChannelKey) {
        self.keys.insert(index, key);
    }

    /// Key for a channel
    pub fn get(&self, index: u8) -> Option<&ChannelKey> {
        self.keys.get(&index)
    }

    /// No keys configured
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Encrypt a payload; `None` when the channel has no key
    pub fn encrypt(&self, channel: u8, packet_id: u32, from: u32, plaintext: &[u8]) -> Option<Vec<u8>> {
        let key = self.get(channel)?;
        let mut buf = plaintext.to_vec();
        key.apply_keystream(packet_id, from, &mut buf);
        Some(buf)
    }

    /// Decrypt a payload; `None` when the channel has no key
    pub fn decrypt(&self, channel: u8, packet_id: u32, from: u32, ciphertext: &[u8]) -> Option<Vec<u8>> {
        // CTR is symmetric
        self.encrypt(channel, packet_id, from, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_with(index: u8, key: ChannelKey) -> ChannelKeys {
        let mut keys = ChannelKeys::default();
        keys.insert(index, key);
        keys
    }

    #[test]
    fn test_nonce_layout() {
        let iv = nonce(0x0102_0304, 0xa1b2_c3d4);
        assert_eq!(&iv[..8], &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
        assert_eq!(&iv[8..12], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&iv[12..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_roundtrip_aes128() {
        let keys = keys_with(0, ChannelKey::Aes128(DEFAULT_PSK));
        for (packet_id, from, plaintext) in [
            (1u32, 2u32, &b"hello mesh"[..]),
            (u32::MAX, 0x1234_5678, &b""[..]),
            (0xdead_beef, u32::MAX, &[0u8; 200][..]),
        ] {
            let ciphertext = keys.encrypt(0, packet_id, from, plaintext).unwrap();
            if !plaintext.is_empty() {
                assert_ne!(ciphertext.as_slice(), plaintext);
            }
            let recovered = keys.decrypt(0, packet_id, from, &ciphertext).unwrap();
            assert_eq!(recovered.as_slice(), plaintext);
        }
    }

    #[test]
    fn test_roundtrip_aes256() {
        let keys = keys_with(3, ChannelKey::Aes256([0x42; 32]));
        let ciphertext = keys.encrypt(3, 77, 88, b"long key").unwrap();
        assert_eq!(keys.decrypt(3, 77, 88, &ciphertext).unwrap(), b"long key");
    }

    #[test]
    fn test_nonce_binds_packet_and_sender() {
        let keys = keys_with(0, ChannelKey::Aes128(DEFAULT_PSK));
        let a = keys.encrypt(0, 1, 2, b"same text").unwrap();
        let b = keys.encrypt(0, 2, 2, b"same text").unwrap();
        let c = keys.encrypt(0, 1, 3, b"same text").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_channel_key() {
        let keys = keys_with(0, ChannelKey::Aes128(DEFAULT_PSK));
        assert!(keys.decrypt(1, 1, 1, b"x").is_none());
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            ChannelKey::parse("default").unwrap(),
            Some(ChannelKey::Aes128(DEFAULT_PSK))
        );
        assert_eq!(
            ChannelKey::parse("1").unwrap(),
            Some(ChannelKey::Aes128(DEFAULT_PSK))
        );

        let mut shifted = DEFAULT_PSK;
        shifted[15] += 2;
        assert_eq!(
            ChannelKey::parse("3").unwrap(),
            Some(ChannelKey::Aes128(shifted))
        );

        assert_eq!(ChannelKey::parse("none").unwrap(), None);
        assert_eq!(
            ChannelKey::parse("0xd4f1bb3a20290759f0bcffabcf4e6901").unwrap(),
            Some(ChannelKey::Aes128(DEFAULT_PSK))
        );
        assert!(matches!(
            ChannelKey::parse(&"ab".repeat(32)).unwrap(),
            Some(ChannelKey::Aes256(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_keys() {
        assert!(ChannelKey::parse("11").is_err());
        assert!(ChannelKey::parse("abcd").is_err());
        assert!(ChannelKey::parse("not hex at all").is_err());
    }

    #[test]
    fn test_from_config_skips_unencrypted() {
        let mut config = BTreeMap::new();
        config.insert(0, "default".to_string());
        config.insert(1, "none".to_string());
        let keys = ChannelKeys::from_config(&config).unwrap();
        assert!(keys.get(0).is_some());
        assert!(keys.get(1).is_none());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let rendered = format!("{:?}", ChannelKey::Aes128(DEFAULT_PSK));
        assert!(!rendered.contains("d4"));
    }
}
