//! Dual-Network Mesh Radio Bridge
//!
//! This crate connects one host to two independently operated mesh radio
//! networks at once and presents them to business logic as a single
//! stream of packets, with replies routed back to wherever each
//! conversation started.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Transport** - Serial/TCP byte link to each radio, frame delimiting
//! 2. **Codec** - Network-specific frames ↔ common [`Packet`] model, channel decryption
//! 3. **Supervision** - Health checks, reconnect with backoff, watchdog escalation
//! 4. **Routing** - Echo suppression, sender → network memory, reply routing
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use duomesh_bridge::{
//!     BridgeConfigBuilder, DualNetworkRouter, LoggingSink, Network, NetworkConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::new()
//!         .network(NetworkConfig::serial(Network::A, "/dev/ttyUSB0").channel_key(0, "default"))
//!         .network(NetworkConfig::tcp(Network::B, "192.168.1.40", 5000))
//!         .default_network(Network::A)
//!         .try_build()?;
//!
//!     let router = DualNetworkRouter::builder(config).start().await?;
//!     let consumer = tokio::spawn(router.clone().run(Arc::new(LoggingSink), None));
//!
//!     // Replies go back on the network the target was last heard on
//!     router.send("hello", 0x1234_5678, None).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     router.shutdown().await;
//!     consumer.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port transport (requires `libudev-dev` on Linux)
//!
//! # Message Flow
//!
//! ## Radio → business logic
//!
//! 1. Reader task pulls one frame off the [`Transport`]
//! 2. [`PacketCodec`] decodes it, decrypting channel payloads when a key is known
//! 3. [`BroadcastDeduplicator`] drops echoes of our own broadcasts
//! 4. [`SenderNetworkMap`] records which network the sender used
//! 5. The packet goes to the [`PacketSink`] and [`CommandProcessor`]
//!
//! ## Business logic → radio
//!
//! 1. Target network: explicit, else sender's last network, else the default
//! 2. Links that are not connected refuse the send immediately
//! 3. [`PacketCodec`] encodes the text, broadcasts are remembered for echo suppression
//! 4. The transport frames and writes it under its write lock
//!
//! # Protocol Details
//!
//! Network A uses a simple framing protocol over serial and TCP:
//! - Bytes 0-1: Magic number `0x94C3`
//! - Bytes 2-3: Payload length (big-endian u16)
//! - Bytes 4+: Protobuf payload
//!
//! Network B frames are `0x3E` (from radio) or `0x3C` (to radio), a
//! little-endian u16 length, then a one-byte code and its body.
//!
//! Maximum LoRa payload is **237 bytes**.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod packet;

// Link layer
pub mod codec;
pub mod directory;
pub mod transport;

// Supervision
pub mod link;
pub mod supervisor;
pub mod watchdog;

// Routing
pub mod collaborator;
pub mod dedup;
pub mod router;
pub mod routing;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience - core
pub use config::{
    BridgeConfig, BridgeConfigBuilder, DedupConfig, HealthConfig, NetworkConfig, ReconnectConfig,
    RoutingConfig, TransportConfig, WatchdogConfig,
};
pub use error::{BridgeError, DecodeError, EncodeError, ErrorClass, Result};
pub use packet::{format_node_id, Network, Packet, PacketBuilder, PortType, BROADCAST_ID};

// Re-exports for convenience - link layer
pub use codec::{
    ChannelKey, ChannelKeys, CompanionCodec, ControlFrame, Decoded, MeshtasticCodec, PacketCodec,
};
pub use directory::{NodeDirectory, NodeEntry, NodeKey};
pub use transport::{FrameBuffer, Framing, TcpTransport, Transport};

#[cfg(feature = "serial")]
pub use transport::SerialTransport;

// Re-exports for convenience - supervision
pub use link::{LinkEvent, NetworkLink};
pub use supervisor::{ConnectionSupervisor, HealthVerdict, TransportState};
pub use watchdog::{
    ChannelWatchdog, EscalationMarker, EscalationPolicy, LogOnlyWatchdog, MarkerFileWatchdog,
    Watchdog,
};

// Re-exports for convenience - routing
pub use collaborator::{CommandProcessor, LoggingSink, PacketSink, Reply};
pub use dedup::BroadcastDeduplicator;
pub use router::{DualNetworkRouter, NetworkStats, OutboundMessage, RouterBuilder, RouterStats};
pub use routing::SenderNetworkMap;

// Protocol constants re-exports
pub use config::{
    is_health_timing_safe, DEFAULT_BAUD_RATE, DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_HOPS,
    DEFAULT_SILENCE_TIMEOUT, LORA_MAX_PAYLOAD, MAX_HOP_LIMIT, MESHTASTIC_MAGIC,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
