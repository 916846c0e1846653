//! Read/write halves shared by the byte-stream transports
//!
//! The read half and the write half each sit behind their own async mutex:
//! the reader loop owns reads, while concurrent senders queue on the write
//! lock so framed writes never interleave. A watch channel carries the
//! open/closed signal so `close()` wakes a pending read immediately.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

use super::framing::{FrameBuffer, Framing};
use crate::error::{BridgeError, Result};

/// Bytes pulled from the stream per read
const READ_CHUNK: usize = 512;

/// Upper bound on a single framed write including the flush
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ReadState {
    half: BoxedReader,
    buffer: FrameBuffer,
}

pub(crate) struct StreamHalves {
    framing: Framing,
    resource: String,
    reader: Mutex<Option<ReadState>>,
    writer: Mutex<Option<BoxedWriter>>,
    open_tx: watch::Sender<bool>,
}

impl StreamHalves {
    pub(crate) fn new(framing: Framing, resource: impl Into<String>) -> Self {
        let (open_tx, _) = watch::channel(false);
        Self {
            framing,
            resource: resource.into(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open_tx,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.open_tx.borrow()
    }

    /// Replace both halves with a freshly opened stream
    pub(crate) async fn install(&self, reader: BoxedReader, writer: BoxedWriter) {
        *self.reader.lock().await = Some(ReadState {
            half: reader,
            buffer: FrameBuffer::new(self.framing),
        });
        *self.writer.lock().await = Some(writer);
        self.open_tx.send_replace(true);
    }

    pub(crate) async fn read_frame(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut open_rx = self.open_tx.subscribe();
        let mut guard = self.reader.lock().await;
        let state = guard.as_mut().ok_or(BridgeError::NotOpen)?;

        if let Some(frame) = state.buffer.next_frame() {
            return Ok(Some(frame));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let read = tokio::select! {
            _ = wait_closed(&mut open_rx) => return Err(BridgeError::Closed),
            read = tokio::time::timeout(timeout, state.half.read(&mut chunk)) => read,
        };

        match read {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(BridgeError::from_io(
                io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the stream"),
                &self.resource,
            )),
            Ok(Ok(n)) => {
                trace!(bytes = n, resource = %self.resource, "Read from stream");
                state.buffer.extend(&chunk[..n]);
                Ok(state.buffer.next_frame())
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(None)
            }
            Ok(Err(e)) => Err(BridgeError::from_io(e, &self.resource)),
        }
    }

    pub(crate) async fn write(&self, payload: &[u8]) -> Result<()> {
        let frame = self.framing.encode(payload)?;
        let mut guard = self.writer.lock().await;
        let half = guard.as_mut().ok_or(BridgeError::NotOpen)?;

        // the radio does not pull from a buffered stream; flush every frame
        let io = async {
            half.write_all(&frame).await?;
            half.flush().await
        };

        match tokio::time::timeout(WRITE_TIMEOUT, io).await {
            Err(_) => Err(BridgeError::WriteTimeout {
                duration_ms: WRITE_TIMEOUT.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(BridgeError::from_io(e, &self.resource)),
            Ok(Ok(())) => {
                trace!(size = frame.len(), resource = %self.resource, "Wrote frame");
                Ok(())
            }
        }
    }

    pub(crate) async fn close(&self) {
        // signal first so a pending read lets go of the reader lock
        self.open_tx.send_replace(false);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(error = %e, resource = %self.resource, "Shutdown on close failed");
            }
        }
        if self.reader.lock().await.take().is_some() {
            debug!(resource = %self.resource, "Stream closed");
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn duplex_halves(framing: Framing) -> (Arc<StreamHalves>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(local);
        let halves = Arc::new(StreamHalves::new(framing, "duplex"));
        halves.install(Box::new(r), Box::new(w)).await;
        (halves, remote)
    }

    #[tokio::test]
    async fn test_read_timeout_returns_none() {
        let (halves, _remote) = duplex_halves(Framing::Meshtastic).await;
        let frame = halves.read_frame(Duration::from_millis(20)).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_written_frame_is_framed_and_flushed() {
        let (halves, mut remote) = duplex_halves(Framing::Meshtastic).await;
        halves.write(b"ping").await.unwrap();

        let mut buf = [0u8; 8];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0x94, 0xC3, 0x00, 0x04, b'p', b'i', b'n', b'g']);
    }

    #[tokio::test]
    async fn test_inbound_frame_is_delivered() {
        let (halves, mut remote) = duplex_halves(Framing::Companion).await;
        remote.write_all(&[0x3E, 0x01, 0x00, 0x83]).await.unwrap();
        let frame = halves.read_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.unwrap().as_ref(), &[0x83]);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (halves, _remote) = duplex_halves(Framing::Meshtastic).await;
        let reader = halves.clone();
        let pending =
            tokio::spawn(async move { reader.read_frame(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        halves.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("close must unblock the read")
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Closed)));
        assert!(!halves.is_open());
    }

    #[tokio::test]
    async fn test_peer_eof_is_recoverable() {
        let (halves, remote) = duplex_halves(Framing::Meshtastic).await;
        drop(remote);
        let err = halves
            .read_frame(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_write_without_stream_is_not_open() {
        let halves = StreamHalves::new(Framing::Meshtastic, "idle");
        assert!(matches!(halves.write(b"x").await, Err(BridgeError::NotOpen)));
    }
}
