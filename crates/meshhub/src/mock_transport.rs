//! Mock transports for testing.
//!
//! In-memory pipes that hand frames over without any byte framing, plus a
//! counter of frames that actually reached the pipe.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::error::Result;
use crate::packet::MAX_PACKET_SIZE;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Messages sent via `send()` appear on the peer's `recv()` and vice versa.
pub struct DuplexChannelTransport {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent: Arc<AtomicUsize>,
    name: String,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let left = Self {
            tx: parking_lot::Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
            sent: Arc::new(AtomicUsize::new(0)),
            name: format!("mem:{}", b),
        };

        let right = Self {
            tx: parking_lot::Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
            sent: Arc::new(AtomicUsize::new(0)),
            name: format!("mem:{}", a),
        };

        (left, right)
    }

    /// Shared count of frames handed to the pipe by this side.
    pub fn sent_counter(&self) -> Arc<AtomicUsize> {
        self.sent.clone()
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(frame.len()));
        }
        let tx = self.tx.lock().clone().ok_or(Error::Closed)?;
        tx.send(frame.to_vec())
            .map_err(|_| Error::Connection("channel closed".into()))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().take();
        Ok(())
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}
