//! Test utilities for driving links and the router without radios
//!
//! [`MockTransport`] stands in for a serial or TCP link: tests inject
//! inbound frames and errors, inspect what was written, and make opens
//! fail on demand. The frame builders produce bodies in each network's
//! wire format so the real codecs are exercised end to end.
//!
//! # Example
//!
//! ```rust,ignore
//! use duomesh_bridge::test_utils::{meshtastic_text_frame, MockTransport};
//!
//! let transport = Arc::new(MockTransport::new("network-a"));
//! let router = DualNetworkRouter::builder(config)
//!     .transport(Network::A, transport.clone())
//!     .start()
//!     .await?;
//!
//! transport.inject_frame(meshtastic_text_frame(0x1234, BROADCAST_ID, 1, "ping"));
//! ```

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::{mpsc, watch};

use crate::codec::companion::{command, response};
use crate::codec::meshtastic::{proto, PORT_TEXT};
use crate::codec::ChannelKey;
use crate::collaborator::PacketSink;
use crate::error::{BridgeError, Result};
use crate::packet::Packet;
use crate::transport::Transport;

/// In-memory transport
pub struct MockTransport {
    name: String,
    inbound_tx: mpsc::UnboundedSender<Result<Bytes>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes>>>,
    open_tx: watch::Sender<bool>,
    written: Mutex<Vec<Bytes>>,
    write_count: watch::Sender<usize>,
    fail_opens: AtomicU32,
    fail_writes: AtomicU32,
    opens: AtomicU32,
    closes: AtomicU32,
}

impl MockTransport {
    /// Create a closed mock transport
    pub fn new(name: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (open_tx, _) = watch::channel(false);
        let (write_count, _) = watch::channel(0);
        Self {
            name: name.into(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            open_tx,
            written: Mutex::new(Vec::new()),
            write_count,
            fail_opens: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        }
    }

    /// Queue a frame body for the reader
    pub fn inject_frame(&self, frame: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(Ok(frame.into()));
    }

    /// Queue a read error for the reader
    pub fn inject_error(&self, err: BridgeError) {
        let _ = self.inbound_tx.send(Err(err));
    }

    /// Refuse the next `n` opens (`u32::MAX` refuses forever)
    ///
    /// Refusals are recoverable connection errors.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Break the next `n` writes with a broken pipe
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Every open attempt so far, failed ones included
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Close calls so far
    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Payloads written so far (unframed)
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    /// Wait until at least `count` writes have happened since creation
    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.write_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

async fn wait_closed(open_rx: &mut watch::Receiver<bool>) {
    loop {
        if !*open_rx.borrow_and_update() {
            return;
        }
        if open_rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_opens) {
            return Err(BridgeError::from_io(
                io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"),
                &self.name,
            ));
        }
        self.open_tx.send_replace(true);
        Ok(())
    }

    async fn read_frame(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut open_rx = self.open_tx.subscribe();
        if !*open_rx.borrow() {
            return Err(BridgeError::NotOpen);
        }

        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            _ = wait_closed(&mut open_rx) => Err(BridgeError::Closed),
            item = tokio::time::timeout(timeout, inbound.recv()) => match item {
                Ok(Some(result)) => result.map(Some),
                Ok(None) => Err(BridgeError::Closed),
                Err(_) => Ok(None),
            },
        }
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(BridgeError::NotOpen);
        }
        if Self::take_failure(&self.fail_writes) {
            return Err(BridgeError::from_io(
                io::Error::new(io::ErrorKind::BrokenPipe, "mock pipe"),
                &self.name,
            ));
        }
        self.written.lock().push(Bytes::copy_from_slice(payload));
        self.write_count.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open_tx.send_replace(false);
    }

    fn is_open(&self) -> bool {
        *self.open_tx.borrow()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ===== Network A frames =====

fn from_radio_packet(packet: proto::MeshPacket) -> Bytes {
    let message = proto::FromRadio {
        id: rand::random(),
        payload_variant: Some(proto::from_radio::PayloadVariant::Packet(packet)),
    };
    Bytes::from(message.encode_to_vec())
}

fn text_data(text: &str) -> proto::Data {
    proto::Data {
        portnum: PORT_TEXT,
        payload: text.as_bytes().to_vec(),
        ..Default::default()
    }
}

/// `FromRadio` carrying a plain text packet on channel 0
pub fn meshtastic_text_frame(from: u32, to: u32, id: u32, text: &str) -> Bytes {
    from_radio_packet(proto::MeshPacket {
        from,
        to,
        id,
        hop_limit: 3,
        hop_start: 3,
        rx_snr: 6.25,
        rx_rssi: -90,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(text_data(text))),
        ..Default::default()
    })
}

/// `FromRadio` carrying a text packet encrypted with `key`
pub fn meshtastic_encrypted_frame(
    from: u32,
    to: u32,
    id: u32,
    channel: u8,
    key: &ChannelKey,
    text: &str,
) -> Bytes {
    let mut payload = text_data(text).encode_to_vec();
    key.apply_keystream(id, from, &mut payload);
    from_radio_packet(proto::MeshPacket {
        from,
        to,
        id,
        channel: u32::from(channel),
        hop_limit: 3,
        hop_start: 3,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(payload)),
        ..Default::default()
    })
}

/// `FromRadio` announcing our own node number
pub fn meshtastic_my_info_frame(node: u32) -> Bytes {
    let message = proto::FromRadio {
        id: rand::random(),
        payload_variant: Some(proto::from_radio::PayloadVariant::MyInfo(proto::MyNodeInfo {
            my_node_num: node,
        })),
    };
    Bytes::from(message.encode_to_vec())
}

/// `FromRadio` describing another node
pub fn meshtastic_node_info_frame(node: u32, long_name: &str, short_name: &str) -> Bytes {
    let message = proto::FromRadio {
        id: rand::random(),
        payload_variant: Some(proto::from_radio::PayloadVariant::NodeInfo(proto::NodeInfo {
            num: node,
            user: Some(proto::User {
                id: crate::packet::format_node_id(node),
                long_name: long_name.to_string(),
                short_name: short_name.to_string(),
            }),
        })),
    };
    Bytes::from(message.encode_to_vec())
}

/// Destination and text of an outbound `ToRadio` text packet
pub fn meshtastic_outbound_text(frame: &[u8]) -> Option<(u32, String)> {
    let message = proto::ToRadio::decode(frame).ok()?;
    match message.payload_variant? {
        proto::to_radio::PayloadVariant::Packet(packet) => match packet.payload_variant? {
            proto::mesh_packet::PayloadVariant::Decoded(data) if data.portnum == PORT_TEXT => {
                Some((packet.to, String::from_utf8(data.payload).ok()?))
            }
            _ => None,
        },
        _ => None,
    }
}

// ===== Network B frames =====

/// Direct message from the contact whose key starts with `prefix`
pub fn companion_contact_frame(prefix: [u8; 6], text: &str) -> Bytes {
    let mut frame = vec![response::CONTACT_MSG];
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(&[1, 0]); // path_len, plain text
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(text.as_bytes());
    Bytes::from(frame)
}

/// Channel message sent by `sender`
pub fn companion_channel_frame(channel: u8, sender: &str, text: &str) -> Bytes {
    let mut frame = vec![response::CHANNEL_MSG, channel, 1, 0];
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(format!("{}: {}", sender, text).as_bytes());
    Bytes::from(frame)
}

/// Text carried by an outbound send command
pub fn companion_outbound_text(frame: &[u8]) -> Option<String> {
    let body = match *frame.first()? {
        // code, type, channel, timestamp
        command::SEND_CHANNEL_TXT_MSG => frame.get(7..)?,
        // code, type, attempt, timestamp, key prefix
        command::SEND_TXT_MSG => frame.get(13..)?,
        _ => return None,
    };
    String::from_utf8(body.to_vec()).ok()
}

// ===== Collaborators =====

/// Sink that keeps every packet it receives
#[derive(Debug)]
pub struct CollectingSink {
    packets: Mutex<Vec<Packet>>,
    count: watch::Sender<usize>,
}

impl CollectingSink {
    /// Empty sink
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            packets: Mutex::new(Vec::new()),
            count,
        }
    }

    /// Packets recorded so far
    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }

    /// Wait until at least `count` packets were recorded
    pub async fn wait_for(&self, count: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for CollectingSink {
    fn record(&self, packet: Packet) {
        self.packets.lock().push(packet);
        self.count.send_modify(|n| *n += 1);
    }
}
