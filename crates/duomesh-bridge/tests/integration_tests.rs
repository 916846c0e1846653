//! Integration tests for the dual-network bridge
//!
//! These tests drive the router end to end through mock transports and the
//! real codecs:
//! - Startup with one network down (single-network fallback)
//! - Reply routing back to the network a sender used
//! - Self-broadcast echo suppression
//! - Direct message decryption with channel keys
//! - Escalation when a link fails for good
//! - The TCP transport against a local listener

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use duomesh_bridge::codec::companion::node_id_from_key;
use duomesh_bridge::test_utils::{
    companion_contact_frame, companion_outbound_text, meshtastic_encrypted_frame,
    meshtastic_outbound_text, meshtastic_text_frame, CollectingSink, MockTransport,
};
use duomesh_bridge::{
    BridgeConfig, BridgeConfigBuilder, BridgeError, ChannelKey, ChannelWatchdog, CommandProcessor,
    DualNetworkRouter, Framing, Network, NetworkConfig, OutboundMessage, Packet, PacketSink,
    Reply, TcpTransport, Transport, TransportState, BROADCAST_ID,
};

const LOCAL_A: u32 = 0x0000_ABCD;
const CONTACT: [u8; 6] = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

fn config() -> BridgeConfig {
    BridgeConfigBuilder::new()
        .network(
            NetworkConfig::tcp(Network::A, "radio-a", 4403)
                .channel_key(0, "default")
                .node_id(format!("!{:08x}", LOCAL_A)),
        )
        .network(NetworkConfig::tcp(Network::B, "radio-b", 5000))
        .default_network(Network::A)
        .build()
}

struct Harness {
    router: Arc<DualNetworkRouter>,
    a: Arc<MockTransport>,
    b: Arc<MockTransport>,
    sink: Arc<CollectingSink>,
    consumer: tokio::task::JoinHandle<duomesh_bridge::Result<()>>,
}

impl Harness {
    async fn start(processor: Option<Arc<dyn CommandProcessor>>) -> Self {
        let a = Arc::new(MockTransport::new("radio-a"));
        let b = Arc::new(MockTransport::new("radio-b"));
        let router = DualNetworkRouter::builder(config())
            .transport(Network::A, a.clone())
            .transport(Network::B, b.clone())
            .start()
            .await
            .unwrap();

        let sink = Arc::new(CollectingSink::new());
        let consumer = tokio::spawn(
            router
                .clone()
                .run(sink.clone() as Arc<dyn PacketSink>, processor),
        );

        Self {
            router,
            a,
            b,
            sink,
            consumer,
        }
    }

    async fn wait_for_packets(&self, count: usize) -> Vec<Packet> {
        tokio::time::timeout(WAIT, self.sink.wait_for(count))
            .await
            .expect("packets not delivered in time");
        self.sink.packets()
    }

    async fn stop(self) {
        self.router.shutdown().await;
        self.consumer.await.unwrap().unwrap();
    }
}

struct PingProcessor;

#[async_trait]
impl CommandProcessor for PingProcessor {
    async fn process(&self, packet: &Packet) -> Option<Reply> {
        (packet.text()? == "ping").then(|| Reply::to_sender("pong"))
    }
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_secondary_down_at_startup_keeps_primary_wired() {
    let a = Arc::new(MockTransport::new("radio-a"));
    let b = Arc::new(MockTransport::new("radio-b"));
    b.fail_next_opens(u32::MAX);

    let router = DualNetworkRouter::builder(config())
        .transport(Network::A, a.clone())
        .transport(Network::B, b.clone())
        .start()
        .await
        .unwrap();

    assert!(router.is_single_network());
    assert_eq!(b.open_count(), 3);
    assert_eq!(router.active_networks(), vec![Network::A]);
    assert_eq!(router.link_state(Network::B), None);
    assert!(router.is_inbound_wired(Network::A));

    // and packets on the primary actually reach the consumer
    let sink = Arc::new(CollectingSink::new());
    let consumer = tokio::spawn(router.clone().run(sink.clone() as Arc<dyn PacketSink>, None));
    a.inject_frame(meshtastic_text_frame(0x0101, BROADCAST_ID, 1, "anyone there?"));

    tokio::time::timeout(WAIT, sink.wait_for(1)).await.unwrap();
    assert_eq!(sink.packets()[0].text(), Some("anyone there?"));

    router.shutdown().await;
    consumer.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_primary_down_at_startup_is_an_error() {
    let a = Arc::new(MockTransport::new("radio-a"));
    a.fail_next_opens(u32::MAX);

    let result = DualNetworkRouter::builder(config())
        .transport(Network::A, a)
        .transport(Network::B, Arc::new(MockTransport::new("radio-b")))
        .start()
        .await;
    assert!(result.unwrap_err().is_retriable());
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_reply_returns_on_network_b() {
    let harness = Harness::start(None).await;
    let sender = node_id_from_key(&CONTACT);

    harness
        .b
        .inject_frame(companion_contact_frame(CONTACT, "status?"));
    let packets = harness.wait_for_packets(1).await;
    assert_eq!(packets[0].network(), Network::B);
    assert_eq!(packets[0].from_id(), sender);

    let used = harness.router.send("hello", sender, None).await.unwrap();
    assert_eq!(used, Network::B);

    let last = harness.b.written().last().cloned().unwrap();
    assert_eq!(companion_outbound_text(&last).as_deref(), Some("hello"));
    // network A only ever saw its handshake
    assert_eq!(harness.a.written().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_sender_moving_networks_follows_latest() {
    let harness = Harness::start(None).await;
    let sender = node_id_from_key(&CONTACT);

    harness.b.inject_frame(companion_contact_frame(CONTACT, "one"));
    harness.wait_for_packets(1).await;
    harness
        .a
        .inject_frame(meshtastic_text_frame(sender, LOCAL_A, 2, "two"));
    harness.wait_for_packets(2).await;

    assert_eq!(harness.router.send("back", sender, None).await.unwrap(), Network::A);
    let (to, text) = meshtastic_outbound_text(&harness.a.written()[1]).unwrap();
    assert_eq!((to, text.as_str()), (sender, "back"));

    harness.stop().await;
}

#[tokio::test]
async fn test_command_processor_reply_routed_to_origin() {
    let harness = Harness::start(Some(Arc::new(PingProcessor))).await;

    harness.b.inject_frame(companion_contact_frame(CONTACT, "ping"));
    harness.wait_for_packets(1).await;

    // handshake, queue drain, pong
    tokio::time::timeout(WAIT, harness.b.wait_for_writes(3))
        .await
        .unwrap();
    let written = harness.b.written();
    assert_eq!(companion_outbound_text(&written[2]).as_deref(), Some("pong"));
    assert_eq!(harness.a.written().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_send_to_downed_link_fails_fast() {
    let harness = Harness::start(None).await;
    harness
        .router
        .link(Network::B)
        .unwrap()
        .supervisor()
        .on_error(&BridgeError::from_io(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            "radio-b",
        ));

    let err = harness
        .router
        .send_message(OutboundMessage::broadcast("net").on_network(Network::B))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::LinkUnavailable {
            network: Network::B,
            state: TransportState::Degraded
        }
    ));
    // nothing queued behind the outage
    assert_eq!(harness.b.written().len(), 1);

    harness.stop().await;
}

// ============================================================================
// Echo suppression
// ============================================================================

#[tokio::test]
async fn test_own_broadcast_echo_never_reaches_consumer() {
    let harness = Harness::start(None).await;

    harness
        .router
        .send_message(OutboundMessage::broadcast("repeater test"))
        .await
        .unwrap();

    harness
        .a
        .inject_frame(meshtastic_text_frame(0x7777, BROADCAST_ID, 10, "repeater test"));
    harness
        .a
        .inject_frame(meshtastic_text_frame(0x7777, BROADCAST_ID, 11, "something else"));

    let packets = harness.wait_for_packets(1).await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].text(), Some("something else"));

    let stats = harness.router.stats();
    assert_eq!(stats.network(Network::A).unwrap().self_echoes_dropped, 1);

    harness.stop().await;
}

// ============================================================================
// Decryption
// ============================================================================

#[tokio::test]
async fn test_encrypted_direct_message_decrypted() {
    let harness = Harness::start(None).await;
    let key = ChannelKey::parse("default").unwrap().unwrap();

    harness.a.inject_frame(meshtastic_encrypted_frame(
        0x5150, LOCAL_A, 0x0102_0304, 0, &key, "meet at the ridge",
    ));

    let packets = harness.wait_for_packets(1).await;
    assert_eq!(packets[0].text(), Some("meet at the ridge"));
    assert!(!packets[0].decrypt_failed());

    harness.stop().await;
}

#[tokio::test]
async fn test_wrong_key_marks_packet_opaque() {
    let harness = Harness::start(None).await;
    let other_key = ChannelKey::parse("2").unwrap().unwrap();

    harness.a.inject_frame(meshtastic_encrypted_frame(
        0x5150, LOCAL_A, 77, 0, &other_key, "secret",
    ));

    let packets = harness.wait_for_packets(1).await;
    assert!(packets[0].decrypt_failed());
    assert_eq!(packets[0].text(), None);
    assert_eq!(
        harness.router.stats().network(Network::A).unwrap().decrypt_failures,
        1
    );

    harness.stop().await;
}

// ============================================================================
// Escalation
// ============================================================================

#[tokio::test]
async fn test_fatal_link_error_escalates() {
    let (watchdog, mut markers) = ChannelWatchdog::new();
    let a = Arc::new(MockTransport::new("radio-a"));
    let b = Arc::new(MockTransport::new("radio-b"));
    let router = DualNetworkRouter::builder(config())
        .transport(Network::A, a.clone())
        .transport(Network::B, b.clone())
        .watchdog(Arc::new(watchdog))
        .start()
        .await
        .unwrap();
    let consumer = tokio::spawn(
        router
            .clone()
            .run(Arc::new(CollectingSink::new()) as Arc<dyn PacketSink>, None),
    );

    b.inject_error(BridgeError::PermissionDenied("/dev/ttyACM0".to_string()));

    let marker = tokio::time::timeout(WAIT, markers.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.component, "duomesh.network-b");
    assert!(marker.reason.contains("Permission denied"));
    assert_eq!(router.link_state(Network::B), Some(TransportState::Failed));
    assert_eq!(router.link_state(Network::A), Some(TransportState::Connected));

    router.shutdown().await;
    consumer.await.unwrap().unwrap();
}

// ============================================================================
// TCP transport
// ============================================================================

#[tokio::test]
async fn test_tcp_transport_frames_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // garbage before the frame must be skipped
        socket
            .write_all(&[0x00, 0x94, 0xC3, 0x00, 0x03, b'a', b'b', b'c'])
            .await
            .unwrap();

        let mut frame = [0u8; 7];
        socket.read_exact(&mut frame).await.unwrap();
        frame
    });

    let transport = TcpTransport::new("127.0.0.1", port, Framing::Meshtastic);
    transport.open().await.unwrap();
    assert!(transport.is_open());

    let mut frame = None;
    for _ in 0..10 {
        frame = transport.read_frame(WAIT).await.unwrap();
        if frame.is_some() {
            break;
        }
    }
    assert_eq!(frame.as_deref(), Some(&b"abc"[..]));

    transport.write(b"xyz").await.unwrap();
    assert_eq!(server.await.unwrap(), [0x94, 0xC3, 0x00, 0x03, b'x', b'y', b'z']);

    transport.close().await;
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_tcp_peer_hangup_is_recoverable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let transport = TcpTransport::new("127.0.0.1", port, Framing::Companion);
    transport.open().await.unwrap();
    server.await.unwrap();

    let err = loop {
        match transport.read_frame(WAIT).await {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(err.is_retriable());
}
