//! TCP transport for radios exposing a network API port

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::info;

use super::framing::Framing;
use super::stream::StreamHalves;
use super::Transport;
use crate::error::{BridgeError, Result};

/// Connect attempt bound; retry belongs to the supervisor
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP connection to a radio (e.g. "192.168.1.100:4403")
pub struct TcpTransport {
    host: String,
    port: u16,
    name: String,
    halves: StreamHalves,
}

impl TcpTransport {
    /// Create a transport for `host:port`
    pub fn new(host: impl Into<String>, port: u16, framing: Framing) -> Self {
        let host = host.into();
        let name = format!("tcp:{}:{}", host, port);
        Self {
            halves: StreamHalves::new(framing, name.clone()),
            host,
            port,
            name,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self) -> Result<()> {
        if self.halves.is_open() {
            return Ok(());
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Err(_) => {
                return Err(BridgeError::from_io(
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    &self.name,
                ))
            }
            Ok(result) => result.map_err(|e| BridgeError::from_io(e, &self.name))?,
        };
        stream
            .set_nodelay(true)
            .map_err(|e| BridgeError::from_io(e, &self.name))?;

        let (reader, writer) = stream.into_split();
        self.halves.install(Box::new(reader), Box::new(writer)).await;

        info!(endpoint = %self.name, "Connected to radio");
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

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("endpoint", &self.name)
            .field("open", &self.halves.is_open())
            .finish()
    }
}
