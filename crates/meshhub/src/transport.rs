//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between hubs.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: A transport moves whole packets. It knows nothing about
//!   packet tags, topology or calls.
//! - **Duplex**: Either side may send at any time; `recv` yields frames in order.
//!   Request/response correlation is built on top, not defined here.
//!
//! Byte streams (TCP, in-memory pipes) are framed with a little-endian `u16`
//! length prefix by `StreamTransport`.

use std::net::SocketAddr;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::packet::MAX_PACKET_SIZE;

/// A duplex frame pipe.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    ///
    /// # Invariants
    /// - Frames longer than `MAX_PACKET_SIZE` are rejected before any byte is written.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receives the next frame. `Ok(None)` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending half. Pending `recv` calls on the peer observe `None`.
    async fn close(&self) -> Result<()>;

    /// Human-readable peer address for logs and diagnostics.
    fn peer(&self) -> String;
}

/// Length-prefixed framing over any async byte stream.
pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    peer: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer: peer.into(),
        }
    }
}

impl StreamTransport<TcpStream> {
    /// Dials a TCP peer.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, addr.to_string()))
    }
}

#[async_trait::async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(frame.len()));
        }
        let mut buf = Vec::with_capacity(frame.len() + 2);
        buf.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        buf.extend_from_slice(frame);

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut len = [0u8; 2];
        match reader.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut frame = vec![0u8; u16::from_le_bytes(len) as usize];
        reader
            .read_exact(&mut frame)
            .await
            .map_err(|e| Error::Connection(format!("truncated frame from {}: {}", self.peer, e)))?;
        Ok(Some(frame))
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
