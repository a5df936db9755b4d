//! # Connections
//!
//! One transport session between two hubs and its protocol state.
//!
//! ## State Machine
//!
//! ```text
//! NotInitialized --send Hello--> HelloSent --HelloResponse--> Active
//! NotInitialized --recv Hello--> Active
//! Active --Disconnect--> Disconnecting --ReadyForDisconnect--> Disconnected
//! (any) --transport failure--> Disconnected
//! ```
//!
//! ## Invariants
//!
//! - Outbound frames go through a single queue drained by one writer task, so
//!   sending never blocks the caller and frames leave in enqueue order.
//! - Packets are encoded and size-checked before they are queued; an oversized
//!   packet never reaches the transport.
//! - `Disconnected` is terminal.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use meshcall::TypeRegistry;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::config::ReconnectPolicy;
use crate::error::Error;
use crate::error::Result;
use crate::packet::HubId;
use crate::packet::Packet;
use crate::transport::Transport;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotInitialized,
    HelloSent,
    Active,
    Disconnecting,
    Disconnected,
}

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Opener,
    Acceptor,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    pub role: Role,
    pub state: ConnectionState,
    pub remote: Option<(HubId, String)>,
    pub read_seq: u64,
    pub write_seq: u64,
    pub last_activity: Instant,
}

pub struct Connection {
    id: ConnectionId,
    role: Role,
    peer: String,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    lease: Arc<tokio::sync::Mutex<()>>,
    read_seq: AtomicU64,
    write_seq: AtomicU64,
    last_activity: Mutex<Instant>,
    remote: Mutex<Option<(HubId, String)>>,
    registry: Arc<TypeRegistry>,
    /// Hubs this connection has told us about.
    learned: Mutex<HashSet<HubId>>,
    /// Hubs we have announced over this connection.
    announced: Mutex<HashSet<HubId>>,
    failure: Mutex<Option<Error>>,
    intentional: AtomicBool,
    reconnect: Option<(SocketAddr, ReconnectPolicy)>,
}

impl Connection {
    /// Wraps a transport and spawns its writer task.
    pub(crate) fn new(
        id: ConnectionId,
        role: Role,
        transport: Arc<dyn Transport>,
        registry: Arc<TypeRegistry>,
        reconnect: Option<(SocketAddr, ReconnectPolicy)>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::NotInitialized);
        let conn = Arc::new(Self {
            id,
            role,
            peer: transport.peer(),
            transport: transport.clone(),
            state,
            outbound: Mutex::new(Some(tx)),
            lease: Arc::new(tokio::sync::Mutex::new(())),
            read_seq: AtomicU64::new(0),
            write_seq: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            remote: Mutex::new(None),
            registry,
            learned: Mutex::new(HashSet::new()),
            announced: Mutex::new(HashSet::new()),
            failure: Mutex::new(None),
            intentional: AtomicBool::new(false),
            reconnect,
        });
        tokio::spawn(write_loop(transport, rx, Arc::downgrade(&conn)));
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// The type registry scope for descriptors crossing this connection.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// The hub at the other end, once the handshake has completed.
    pub fn remote(&self) -> Option<(HubId, String)> {
        self.remote.lock().clone()
    }

    pub fn remote_id(&self) -> Option<HubId> {
        self.remote.lock().as_ref().map(|(id, _)| *id)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self.peer.clone(),
            role: self.role,
            state: self.state(),
            remote: self.remote(),
            read_seq: self.read_seq.load(Ordering::Relaxed),
            write_seq: self.write_seq.load(Ordering::Relaxed),
            last_activity: *self.last_activity.lock(),
        }
    }

    /// The error that closed the connection, if any.
    pub fn failure(&self) -> Option<Error> {
        self.failure.lock().clone()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn reconnect(&self) -> Option<(SocketAddr, ReconnectPolicy)> {
        self.reconnect
    }

    pub(crate) fn set_remote(&self, hub: HubId, name: String) {
        *self.remote.lock() = Some((hub, name));
    }

    /// Moves to `to` unless the connection is already `Disconnected`.
    pub(crate) fn set_state(&self, to: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Disconnected || *s == to {
                return false;
            }
            *s = to;
            true
        })
    }

    pub(crate) fn touch(&self) {
        self.read_seq.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn learn(&self, hub: HubId) -> bool {
        self.learned.lock().insert(hub)
    }

    pub(crate) fn unlearn(&self, hub: HubId) -> bool {
        self.learned.lock().remove(&hub)
    }

    pub(crate) fn mark_announced(&self, hub: HubId) -> bool {
        self.announced.lock().insert(hub)
    }

    pub(crate) fn withdraw_announced(&self, hub: HubId) -> bool {
        self.announced.lock().remove(&hub)
    }

    pub(crate) fn is_intentional(&self) -> bool {
        self.intentional.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_intentional(&self) {
        self.intentional.store(true, Ordering::SeqCst);
    }

    /// Encodes and queues a packet.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Err(Error::Closed);
        }
        let frame = packet.encode()?;
        let tx = self.outbound.lock().clone().ok_or(Error::Closed)?;
        tx.send(frame).map_err(|_| Error::Closed)?;
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(peer = %self.peer, seq, kind = packet.kind(), "queued packet");
        Ok(())
    }

    /// Non-blocking lease for an outgoing call.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Lease> {
        let guard = self.lease.clone().try_lock_owned().ok()?;
        Some(Lease { conn: self.clone(), _guard: guard })
    }

    pub async fn acquire(self: &Arc<Self>) -> Lease {
        let guard = self.lease.clone().lock_owned().await;
        Lease { conn: self.clone(), _guard: guard }
    }

    /// Waits until the state satisfies `done`.
    pub(crate) async fn wait_for(
        &self,
        done: impl Fn(ConnectionState) -> bool,
        timeout: Duration,
        what: &'static str,
    ) -> Result<ConnectionState> {
        let mut rx = self.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| done(*s))).await {
            Ok(Ok(s)) => Ok(*s),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout(what)),
        }
    }

    /// Resolves once the connection is `Disconnected`.
    pub(crate) async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Disconnected).await;
    }

    /// Stops accepting packets. Queued frames are still flushed before the
    /// transport is closed.
    pub(crate) fn close(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        self.outbound.lock().take();
    }

    /// Records the first failure and closes.
    pub(crate) fn fail(&self, error: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_some() || self.state() == ConnectionState::Disconnected {
                return;
            }
            tracing::error!(peer = %self.peer, error = %error, "connection failed");
            *failure = Some(error);
        }
        self.close();
    }

    /// Cooperative teardown: `Disconnect`, then wait for `ReadyForDisconnect`.
    pub async fn disconnect(&self, timeout: Duration) -> Result<()> {
        self.mark_intentional();
        if !self.is_active() || !self.set_state(ConnectionState::Disconnecting) {
            self.close();
            return Ok(());
        }
        self.send(&Packet::Disconnect)?;
        let waited = self
            .wait_for(|s| s == ConnectionState::Disconnected, timeout, "ReadyForDisconnect")
            .await;
        self.close();
        waited.map(|_| ())
    }
}

async fn write_loop(transport: Arc<dyn Transport>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, conn: Weak<Connection>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = transport.send(&frame).await {
            if let Some(conn) = conn.upgrade() {
                conn.fail(e);
            }
            break;
        }
    }
    if let Err(e) = transport.close().await {
        tracing::debug!(peer = %transport.peer(), error = %e, "transport close failed");
    }
}

/// Exclusive use of a connection for one outgoing request.
pub struct Lease {
    conn: Arc<Connection>,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn send(&self, packet: &Packet) -> Result<()> {
        self.conn.send(packet)
    }
}
