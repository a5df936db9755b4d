//! # Remote Streams
//!
//! Byte streams a hub exposes to the mesh, addressed by `(hub id, stream id)`.
//!
//! A `RemoteStreamHandle` allows one operation in flight at a time. Reads and
//! writes larger than one packet are split into `MAX_CHUNK` pieces.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::awaiter::Completion;
use crate::error::Error;
use crate::error::Result;
use crate::hub::Hub;
use crate::packet::HubId;
use crate::packet::Packet;

pub mod flags {
    pub const CAN_READ: u8 = 1;
    pub const CAN_WRITE: u8 = 2;
    pub const CAN_SEEK: u8 = 4;
}

/// Largest payload of a single `StreamData`/`StreamWrite`, leaving room for the
/// relay envelope.
pub const MAX_CHUNK: usize = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub length: i64,
    pub position: i64,
    pub flags: u8,
}

impl StreamInfo {
    pub fn can_read(&self) -> bool {
        self.flags & flags::CAN_READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.flags & flags::CAN_WRITE != 0
    }

    pub fn can_seek(&self) -> bool {
        self.flags & flags::CAN_SEEK != 0
    }
}

/// A stream served to the mesh.
#[async_trait::async_trait]
pub trait ExposedStream: Send + Sync + 'static {
    async fn info(&self) -> Result<StreamInfo>;

    /// Reads up to `len` bytes from the current position. Empty at end of stream.
    async fn read(&self, len: usize) -> Result<Vec<u8>>;

    /// Writes at the current position and returns the new position.
    async fn write(&self, data: &[u8]) -> Result<i64>;

    async fn seek(&self, position: i64) -> Result<i64>;

    async fn close(&self) -> Result<()>;
}

/// Largest size a `MemoryStream` may grow to, and the furthest it may seek.
pub const MAX_MEMORY_STREAM_LEN: usize = 64 << 20;

/// An in-memory stream.
pub struct MemoryStream {
    inner: Mutex<MemoryInner>,
    flags: u8,
}

struct MemoryInner {
    data: Vec<u8>,
    position: usize,
    closed: bool,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_flags(data, flags::CAN_READ | flags::CAN_WRITE | flags::CAN_SEEK)
    }

    pub fn read_only(data: Vec<u8>) -> Self {
        Self::with_flags(data, flags::CAN_READ | flags::CAN_SEEK)
    }

    fn with_flags(data: Vec<u8>, flags: u8) -> Self {
        Self { inner: Mutex::new(MemoryInner { data, position: 0, closed: false }), flags }
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn check(&self, inner: &MemoryInner, flag: u8, what: &str) -> Result<()> {
        if inner.closed {
            return Err(Error::Closed);
        }
        if self.flags & flag == 0 {
            return Err(Error::Io(format!("stream does not support {}", what)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExposedStream for MemoryStream {
    async fn info(&self) -> Result<StreamInfo> {
        let inner = self.inner.lock();
        Ok(StreamInfo { length: inner.data.len() as i64, position: inner.position as i64, flags: self.flags })
    }

    async fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        self.check(&inner, flags::CAN_READ, "reading")?;
        let start = inner.position.min(inner.data.len());
        let end = start.saturating_add(len).min(inner.data.len());
        let chunk = inner.data[start..end].to_vec();
        inner.position = end;
        Ok(chunk)
    }

    async fn write(&self, data: &[u8]) -> Result<i64> {
        let mut inner = self.inner.lock();
        self.check(&inner, flags::CAN_WRITE, "writing")?;
        let start = inner.position;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= MAX_MEMORY_STREAM_LEN)
            .ok_or_else(|| Error::Io(format!("write past the {} byte stream limit", MAX_MEMORY_STREAM_LEN)))?;
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(data);
        inner.position = end;
        Ok(end as i64)
    }

    async fn seek(&self, position: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        self.check(&inner, flags::CAN_SEEK, "seeking")?;
        let target = usize::try_from(position)
            .ok()
            .filter(|p| *p <= MAX_MEMORY_STREAM_LEN)
            .ok_or_else(|| Error::Io(format!("seek to position {} outside the stream limit", position)))?;
        inner.position = target;
        Ok(position)
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

/// Mesh-wide address of an exposed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamToken {
    pub hub: HubId,
    pub stream: u32,
}

enum Backend {
    Local(Arc<dyn ExposedStream>),
    Remote(Hub),
}

/// Client side of an exposed stream.
pub struct RemoteStreamHandle {
    token: StreamToken,
    backend: Backend,
    busy: AtomicBool,
    info: Mutex<StreamInfo>,
}

struct Busy<'a>(&'a AtomicBool);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RemoteStreamHandle {
    pub(crate) fn local(token: StreamToken, stream: Arc<dyn ExposedStream>, info: StreamInfo) -> Self {
        Self { token, backend: Backend::Local(stream), busy: AtomicBool::new(false), info: Mutex::new(info) }
    }

    pub(crate) fn remote(token: StreamToken, hub: Hub, info: StreamInfo) -> Self {
        Self { token, backend: Backend::Remote(hub), busy: AtomicBool::new(false), info: Mutex::new(info) }
    }

    pub fn token(&self) -> StreamToken {
        self.token
    }

    /// Metadata as of the last completed operation.
    pub fn cached_info(&self) -> StreamInfo {
        *self.info.lock()
    }

    fn begin(&self) -> Result<Busy<'_>> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::StreamBusy);
        }
        Ok(Busy(&self.busy))
    }

    /// Refreshes and returns the stream metadata.
    pub async fn info(&self) -> Result<StreamInfo> {
        let _busy = self.begin()?;
        let info = match &self.backend {
            Backend::Local(stream) => stream.info().await?,
            Backend::Remote(hub) => fetch_info(hub, self.token).await?,
        };
        *self.info.lock() = info;
        Ok(info)
    }

    /// Reads up to `len` bytes, stopping early at end of stream.
    pub async fn read(&self, len: usize) -> Result<Vec<u8>> {
        let _busy = self.begin()?;
        let mut out = Vec::with_capacity(len.min(MAX_CHUNK));
        while out.len() < len {
            let want = (len - out.len()).min(MAX_CHUNK);
            let chunk = match &self.backend {
                Backend::Local(stream) => stream.read(want).await?,
                Backend::Remote(hub) => {
                    let stream = self.token.stream;
                    let reply = hub
                        .request(self.token.hub, |await_id, _| {
                            Ok(Packet::StreamRead { await_id, stream, len: want as i32 })
                        })
                        .await?;
                    expect_data(reply)?
                }
            };
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        self.info.lock().position += out.len() as i64;
        Ok(out)
    }

    /// Writes all of `data`. Returns the new position.
    pub async fn write(&self, data: &[u8]) -> Result<i64> {
        let _busy = self.begin()?;
        let mut position = self.info.lock().position;
        for chunk in data.chunks(MAX_CHUNK) {
            position = match &self.backend {
                Backend::Local(stream) => stream.write(chunk).await?,
                Backend::Remote(hub) => {
                    let stream = self.token.stream;
                    let reply = hub
                        .request(self.token.hub, |await_id, _| {
                            Ok(Packet::StreamWrite { await_id, stream, data: chunk.to_vec() })
                        })
                        .await?;
                    expect_ack(reply)?
                }
            };
        }
        let mut info = self.info.lock();
        info.position = position;
        info.length = info.length.max(position);
        Ok(position)
    }

    pub async fn seek(&self, position: i64) -> Result<i64> {
        let _busy = self.begin()?;
        let position = match &self.backend {
            Backend::Local(stream) => stream.seek(position).await?,
            Backend::Remote(hub) => {
                let stream = self.token.stream;
                let reply = hub
                    .request(self.token.hub, |await_id, _| Ok(Packet::StreamSeek { await_id, stream, position }))
                    .await?;
                expect_ack(reply)?
            }
        };
        self.info.lock().position = position;
        Ok(position)
    }

    /// Closes the stream on its owning hub and withdraws it from the mesh.
    pub async fn close(&self) -> Result<()> {
        let _busy = self.begin()?;
        match &self.backend {
            Backend::Local(stream) => stream.close().await,
            Backend::Remote(hub) => {
                let stream = self.token.stream;
                let reply = hub
                    .request(self.token.hub, |await_id, _| Ok(Packet::StreamClose { await_id, stream }))
                    .await?;
                expect_ack(reply).map(|_| ())
            }
        }
    }
}

pub(crate) async fn fetch_info(hub: &Hub, token: StreamToken) -> Result<StreamInfo> {
    let stream = token.stream;
    let reply = hub
        .request(token.hub, |await_id, _| Ok(Packet::StreamInfoRequest { await_id, stream }))
        .await?;
    match reply {
        Completion::StreamInfo { length, position, flags } => Ok(StreamInfo { length, position, flags }),
        other => unexpected(other),
    }
}

fn expect_data(reply: Completion) -> Result<Vec<u8>> {
    match reply {
        Completion::StreamData(data) => Ok(data),
        other => unexpected(other),
    }
}

fn expect_ack(reply: Completion) -> Result<i64> {
    match reply {
        Completion::StreamAck(position) => Ok(position),
        other => unexpected(other),
    }
}

fn unexpected<T>(reply: Completion) -> Result<T> {
    match reply {
        Completion::Exception(message) => Err(Error::RemoteExecution(message)),
        other => Err(Error::Protocol(format!("unexpected stream reply {:?}", other))),
    }
}

/// Serves one stream request against a local stream. Returns the reply packet.
pub(crate) async fn serve(stream: Option<Arc<dyn ExposedStream>>, request: Packet) -> Option<Packet> {
    let await_id = request.await_id()?;
    let Some(stream) = stream else {
        return Some(Packet::Exception { await_id, message: "unknown stream".into() });
    };
    let reply = match request {
        Packet::StreamInfoRequest { .. } => stream
            .info()
            .await
            .map(|i| Packet::StreamInfo { await_id, length: i.length, position: i.position, flags: i.flags }),
        Packet::StreamRead { len, .. } => {
            let len = usize::try_from(len).unwrap_or(0).min(MAX_CHUNK);
            stream.read(len).await.map(|data| Packet::StreamData { await_id, data })
        }
        Packet::StreamWrite { data, .. } => {
            stream.write(&data).await.map(|position| Packet::StreamAck { await_id, position })
        }
        Packet::StreamSeek { position, .. } => {
            stream.seek(position).await.map(|position| Packet::StreamAck { await_id, position })
        }
        Packet::StreamClose { .. } => stream.close().await.map(|_| Packet::StreamAck { await_id, position: 0 }),
        _ => return None,
    };
    Some(reply.unwrap_or_else(|e| Packet::Exception { await_id, message: e.to_string() }))
}
