//! Byte-level connectivity to one radio link
//!
//! Transports know how frames are delimited on the wire but nothing about
//! what is inside them:
//!
//! - [`tcp::TcpTransport`] - TCP connection to a networked radio
//! - [`serial::SerialTransport`] - Serial port communication (requires `serial` feature)
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```
//!
//! Transports never retry internally. Every failure is handed back to the
//! caller, which leaves reconnect policy to the
//! [`ConnectionSupervisor`](crate::supervisor::ConnectionSupervisor).

mod framing;
mod stream;
mod tcp;

#[cfg(feature = "serial")]
mod serial;

pub use framing::{FrameBuffer, Framing, MAX_FRAME_LEN};
pub use stream::WRITE_TIMEOUT;
pub use tcp::TcpTransport;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};

/// Connectivity to one radio
///
/// All methods take `&self`; implementations serialise writers internally
/// so a transport can be shared between the reader loop and senders.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link; a busy device surfaces as `ResourceLocked`
    async fn open(&self) -> Result<()>;

    /// Wait up to `timeout` for one frame body
    ///
    /// Returns `None` when no complete frame is ready yet.
    /// Returns `Err(Closed)` as soon as [`Transport::close`] is called.
    async fn read_frame(&self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Frame, write and flush one payload
    async fn write(&self, payload: &[u8]) -> Result<()>;

    /// Close the link and wake any pending read
    async fn close(&self);

    /// Whether the link is currently open
    fn is_open(&self) -> bool;

    /// Transport name (for logging)
    fn name(&self) -> &str;
}

/// Build the transport described by a config entry
pub fn from_config(config: &TransportConfig, framing: Framing) -> Result<Arc<dyn Transport>> {
    match config {
        TransportConfig::Tcp { host, port } => {
            Ok(Arc::new(TcpTransport::new(host.clone(), *port, framing)))
        }
        #[cfg(feature = "serial")]
        TransportConfig::Serial { port, baud_rate } => {
            Ok(Arc::new(SerialTransport::new(port, *baud_rate, framing)))
        }
        #[cfg(not(feature = "serial"))]
        TransportConfig::Serial { port, .. } => Err(BridgeError::UnsupportedTransport(format!(
            "serial:{} (built without the `serial` feature)",
            port.display()
        ))),
    }
}
