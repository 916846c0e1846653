//! Serial port transport for USB-attached radios
//!
//! Uses tokio-serial. The port is opened exclusive so a second process
//! cannot interleave bytes into the framed stream; a port held elsewhere
//! surfaces as `ResourceLocked` and is left to the supervisor to retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

use super::framing::Framing;
use super::stream::StreamHalves;
use super::Transport;
use crate::error::{BridgeError, Result};

/// Serial connection to a radio
pub struct SerialTransport {
    port_path: PathBuf,
    baud_rate: u32,
    name: String,
    halves: StreamHalves,
}

impl SerialTransport {
    /// Create a transport for a device path
    pub fn new(port: impl AsRef<Path>, baud_rate: u32, framing: Framing) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());
        Self {
            halves: StreamHalves::new(framing, name.clone()),
            port_path,
            baud_rate,
            name,
        }
    }

    /// Device path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self) -> Result<()> {
        if self.halves.is_open() {
            return Ok(());
        }

        if !self.port_path.exists() {
            return Err(BridgeError::NotFound(self.port_path.display().to_string()));
        }

        #[allow(unused_mut)]
        let mut stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .open_native_async()?;

        #[cfg(unix)]
        stream.set_exclusive(true)?;

        let (reader, writer) = tokio::io::split(stream);
        self.halves.install(Box::new(reader), Box::new(writer)).await;

        info!(port = %self.port_path.display(), baud = self.baud_rate, "Opened serial port");
        Ok(())
    }

    async fn read_frame(&self, timeout: Duration) -> Result<Option<Bytes>> {
        self.halves.read_frame(timeout).await
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.halves.write(payload).await
    }

    async fn close(&self) {
        self.halves.close().await;
    }

    fn is_open(&self) -> bool {
        self.halves.is_open()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.halves.is_open())
            .finish()
    }
}
