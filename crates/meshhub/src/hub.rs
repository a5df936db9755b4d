//! # Hub
//!
//! A mesh participant: its connections, its view of the mesh, the interfaces it
//! implements and the calls it has outstanding.
//!
//! ## Locking
//!
//! Topology and the interface directory live together in one `MeshState` behind
//! a single `parking_lot::Mutex`. It is never held across `.await`.
//! The connection directory, awaiters and streams are separate `DashMap`s.
//! `MeshState` is never locked while a `DashMap` guard is alive: connection
//! lists are collected first, then the mesh is locked. Queueing a packet on a
//! `Connection` only touches that connection's own leaf locks and is allowed
//! while `MeshState` is held.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use meshcall::AllowAll;
use meshcall::CodecContext;
use meshcall::Descriptor;
use meshcall::Param;
use meshcall::Value;
use meshcall::codec;
use meshcall::eval;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::awaiter::Awaiters;
use crate::awaiter::Completion;
use crate::config::HubBuilder;
use crate::config::HubConfig;
use crate::config::ReconnectPolicy;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::connection::ConnectionInfo;
use crate::connection::ConnectionState;
use crate::connection::Role;
use crate::dispatch;
use crate::error::Error;
use crate::error::Result;
use crate::handle::InterfaceHandle;
use crate::handle::Target;
use crate::interface::InterfaceInfo;
use crate::interface::Interfaces;
use crate::normalize::normalize;
use crate::packet::HubId;
use crate::packet::InterfaceLink;
use crate::packet::Packet;
use crate::stream;
use crate::stream::ExposedStream;
use crate::stream::RemoteStreamHandle;
use crate::stream::StreamToken;
use crate::topology::RemoteHubInfo;
use crate::topology::Topology;
use crate::transport::StreamTransport;
use crate::transport::Transport;

#[derive(Default)]
pub(crate) struct MeshState {
    pub(crate) topology: Topology,
    pub(crate) interfaces: Interfaces,
}

pub(crate) struct HubInner {
    pub(crate) config: HubConfig,
    pub(crate) mesh: Mutex<MeshState>,
    pub(crate) connections: DashMap<ConnectionId, Arc<Connection>>,
    pub(crate) awaiters: Arc<Awaiters>,
    pub(crate) streams: DashMap<u32, Arc<dyn ExposedStream>>,
    next_stream: AtomicU32,
    next_connection: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// A cheap, cloneable handle on one mesh participant.
#[derive(Clone)]
pub struct Hub {
    pub(crate) inner: Arc<HubInner>,
}

/// The parameter every call descriptor binds its target to.
pub fn this_param(interface: &str) -> Param {
    Param::new("this", meshcall::TypeTag::external(interface))
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HubInner {
                config,
                mesh: Mutex::new(MeshState::default()),
                connections: DashMap::new(),
                awaiters: Arc::new(Awaiters::default()),
                streams: DashMap::new(),
                next_stream: AtomicU32::new(1),
                next_connection: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    pub fn builder(name: impl Into<String>) -> HubBuilder {
        HubBuilder::new(name)
    }

    pub fn id(&self) -> HubId {
        self.inner.config.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    // ==== CONNECTIONS ====

    /// Binds a TCP listener and accepts connections until shutdown.
    /// Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("bind {}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        tracing::info!(hub = %self.id(), addr = %local, "listening");

        let hub = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
                            }
                            let transport = StreamTransport::new(stream, peer.to_string());
                            hub.accept_transport(Arc::new(transport));
                        }
                        Err(e) => tracing::warn!(addr = %local, error = %e, "accept failed"),
                    },
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
            tracing::debug!(addr = %local, "listener stopped");
        });
        Ok(local)
    }

    /// Dials a TCP peer and completes the handshake.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        self.dial(addr, None).await
    }

    /// Like `connect`, re-dialing after an unexpected loss.
    pub async fn connect_with(&self, addr: SocketAddr, policy: ReconnectPolicy) -> Result<Arc<Connection>> {
        self.dial(addr, Some(policy)).await
    }

    pub(crate) async fn dial(&self, addr: SocketAddr, policy: Option<ReconnectPolicy>) -> Result<Arc<Connection>> {
        let transport = StreamTransport::connect(addr).await?;
        self.open(Arc::new(transport), policy.map(|p| (addr, p))).await
    }

    /// Opens a session over an already connected transport.
    pub async fn connect_transport(&self, transport: Arc<dyn Transport>) -> Result<Arc<Connection>> {
        self.open(transport, None).await
    }

    fn new_connection(
        &self,
        role: Role,
        transport: Arc<dyn Transport>,
        reconnect: Option<(SocketAddr, ReconnectPolicy)>,
    ) -> Arc<Connection> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::new(self.inner.config.registry.child());
        let conn = Connection::new(id, role, transport, registry, reconnect);
        self.inner.connections.insert(id, conn.clone());
        conn
    }

    async fn open(
        &self,
        transport: Arc<dyn Transport>,
        reconnect: Option<(SocketAddr, ReconnectPolicy)>,
    ) -> Result<Arc<Connection>> {
        let conn = self.new_connection(Role::Opener, transport, reconnect);
        conn.set_state(ConnectionState::HelloSent);
        conn.send(&Packet::Hello { hub: self.id(), name: self.name().to_string() })?;
        tokio::spawn(dispatch::run(self.clone(), conn.clone()));

        let settled = conn
            .wait_for(
                |s| s == ConnectionState::Active || s == ConnectionState::Disconnected,
                self.inner.config.handshake_timeout,
                "handshake",
            )
            .await;
        match settled {
            Ok(ConnectionState::Active) => Ok(conn),
            Ok(_) => Err(conn
                .failure()
                .unwrap_or_else(|| Error::Connection("closed during handshake".into()))),
            Err(e) => {
                conn.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Serves the accepting side of a session. The handshake completes in the
    /// background and is abandoned after `handshake_timeout`.
    pub fn accept_transport(&self, transport: Arc<dyn Transport>) -> Arc<Connection> {
        let conn = self.new_connection(Role::Acceptor, transport, None);
        tokio::spawn(dispatch::run(self.clone(), conn.clone()));

        let watchdog = conn.clone();
        let timeout = self.inner.config.handshake_timeout;
        tokio::spawn(async move {
            let settled = watchdog
                .wait_for(
                    |s| s == ConnectionState::Active || s == ConnectionState::Disconnected,
                    timeout,
                    "handshake",
                )
                .await;
            if let Err(e) = settled {
                watchdog.fail(e);
            }
        });
        conn
    }

    /// Cooperatively tears down one connection.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<()> {
        let conn = self
            .inner
            .connections
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| Error::Connection(format!("no connection {}", id)))?;
        conn.disconnect(self.inner.config.disconnect_timeout).await
    }

    /// Stops listening, disconnects every connection and fails outstanding calls.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let conns: Vec<Arc<Connection>> = self.inner.connections.iter().map(|c| c.clone()).collect();
        let timeout = self.inner.config.disconnect_timeout;
        let results = futures::future::join_all(conns.iter().map(|c| c.disconnect(timeout))).await;
        for (conn, result) in conns.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(peer = %conn.peer(), error = %e, "unclean disconnect");
            }
        }
        self.inner.awaiters.fail_all(Error::Closed);
        tracing::info!(hub = %self.id(), "shut down");
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.connections.get(&id).map(|c| c.clone())
    }

    pub(crate) fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.clone())
            .collect()
    }

    // ==== DIAGNOSTICS ====

    /// Ids of every hub currently reachable, sorted.
    pub fn known_hubs(&self) -> Vec<HubId> {
        self.inner.mesh.lock().topology.ids()
    }

    pub fn remote_hub(&self, id: HubId) -> Option<RemoteHubInfo> {
        self.inner.mesh.lock().topology.info(id)
    }

    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.inner.mesh.lock().interfaces.infos()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.inner.connections.iter().map(|c| c.info()).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.awaiters.len()
    }

    // ==== INTERFACES ====

    /// Publishes a local implementation and announces it to every peer.
    /// Returns the interface's local id.
    pub fn register_interface(&self, name: &str, version: i32, target: Value) -> Result<u32> {
        let conns = self.active_connections();
        let own = self.id();
        let mut mesh = self.inner.mesh.lock();
        let id = mesh.interfaces.register_local(name, version, target)?;
        let links = mesh.interfaces.get(name).map(|i| i.entries(own)).unwrap_or_default();
        for conn in &conns {
            dispatch::send_links(conn, name, &links);
        }
        drop(mesh);
        tracing::info!(hub = %own, interface = name, id, version, "registered interface");
        Ok(id)
    }

    /// Withdraws the local implementation mesh-wide.
    pub fn unregister_interface(&self, name: &str) -> Result<()> {
        let conns = self.active_connections();
        let removed = self.inner.mesh.lock().interfaces.unregister_local(name);
        if removed.is_none() {
            return Err(Error::UnknownInterface(name.to_string()));
        }
        let packet = Packet::UnregisterInterface { name: name.to_string(), hub: self.id() };
        for conn in &conns {
            dispatch::send_quietly(conn, &packet);
        }
        tracing::info!(hub = %self.id(), interface = name, "unregistered interface");
        Ok(())
    }

    /// A handle on `name`: the local implementation if there is one, otherwise
    /// the closest remote provider.
    pub fn interface(&self, name: &str) -> Result<InterfaceHandle> {
        self.lookup(name, None)
    }

    /// A handle on the provider of `name` at exactly `version`.
    pub fn interface_version(&self, name: &str, version: i32) -> Result<InterfaceHandle> {
        self.lookup(name, Some(version))
    }

    fn lookup(&self, name: &str, version: Option<i32>) -> Result<InterfaceHandle> {
        let unknown = || Error::UnknownInterface(name.to_string());
        let mesh = self.inner.mesh.lock();
        let iface = mesh.interfaces.get(name).ok_or_else(unknown)?;
        if let Some(local) = &iface.local {
            if version.is_none_or(|v| v == local.version) {
                let target = Target::Local { id: local.id, version: local.version };
                return Ok(InterfaceHandle::new(self.clone(), name, target));
            }
        }
        let link = iface
            .links
            .iter()
            .filter(|l| version.is_none_or(|v| v == l.version))
            .filter_map(|l| mesh.topology.distance(l.hub).map(|d| (d, l)))
            .min_by_key(|(d, l)| (*d, l.hub))
            .map(|(_, l)| *l)
            .ok_or_else(unknown)?;
        Ok(InterfaceHandle::new(self.clone(), name, Target::Remote(link)))
    }

    /// Runs a descriptor against this hub's own implementation. Every member is allowed.
    pub(crate) async fn call_local(&self, id: u32, descriptor: &Descriptor, this: Param) -> Result<Value> {
        let (name, target) = {
            let mesh = self.inner.mesh.lock();
            let (name, local) = mesh
                .interfaces
                .local(id)
                .ok_or_else(|| Error::UnknownInterface(format!("#{}", id)))?;
            (name.to_string(), local.target.clone())
        };
        tracing::trace!(interface = %name, "local call");
        let catalog = &self.inner.config.catalog;
        let value = eval::evaluate(descriptor, &[(this, target)], catalog, &AllowAll)?;
        Ok(normalize(value).await?)
    }

    pub(crate) async fn call_remote(&self, link: InterfaceLink, descriptor: &Descriptor, this: Param) -> Result<Value> {
        let catalog = self.inner.config.catalog.clone();
        let (reply, conn) = self
            .exchange(link.hub, |await_id, conn| {
                let ctx = CodecContext::new(conn.registry(), &catalog);
                let mut scope = vec![this];
                let descriptor = codec::encode(ctx, descriptor, &mut scope)?;
                Ok(Packet::Call { await_id, interface: link.id, descriptor })
            })
            .await?;
        match reply {
            Completion::Value(bytes) => {
                let ctx = CodecContext::new(conn.registry(), &catalog);
                Ok(codec::value_from_bytes(ctx, &bytes)?)
            }
            Completion::Exception(message) => Err(Error::RemoteExecution(message)),
            other => Err(Error::Protocol(format!("unexpected call reply {:?}", other))),
        }
    }

    // ==== REQUESTS ====

    /// Sends one enveloped request to `target` and waits for its reply.
    pub(crate) async fn request<F>(&self, target: HubId, build: F) -> Result<Completion>
    where
        F: FnOnce(i32, &Connection) -> Result<Packet>,
    {
        self.exchange(target, build).await.map(|(reply, _)| reply)
    }

    /// Like `request`, also returning the connection the request left on.
    async fn exchange<F>(&self, target: HubId, build: F) -> Result<(Completion, Arc<Connection>)>
    where
        F: FnOnce(i32, &Connection) -> Result<Packet>,
    {
        let route = self.inner.mesh.lock().topology.route(target);
        let route = route.ok_or(Error::UnknownHub(target))?;
        let awaiter = self.inner.awaiters.register(target);
        if !self.inner.mesh.lock().topology.contains(target) {
            return Err(Error::HubUnavailable(target));
        }

        let lease = route.select(self.inner.config.acquire_timeout).await?;
        let conn = lease.connection().clone();
        let inner = build(awaiter.id(), &conn)?.encode()?;
        lease.send(&Packet::RetransmitTo { receiver: target, sender: self.id(), packet: inner })?;
        drop(lease);
        tracing::debug!(hub = %self.id(), target = %target, await_id = awaiter.id(), peer = %conn.peer(), "request sent");

        let reply = awaiter.wait(self.inner.config.call_timeout).await?;
        Ok((reply, conn))
    }

    // ==== STREAMS ====

    /// Serves `stream` to the mesh under a fresh id.
    pub fn expose_stream(&self, stream: Arc<dyn ExposedStream>) -> StreamToken {
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        self.inner.streams.insert(id, stream);
        StreamToken { hub: self.id(), stream: id }
    }

    pub fn unexpose_stream(&self, id: u32) -> bool {
        self.inner.streams.remove(&id).is_some()
    }

    /// Opens a handle on an exposed stream, fetching its metadata.
    pub async fn open_stream(&self, token: StreamToken) -> Result<RemoteStreamHandle> {
        if token.hub == self.id() {
            let stream = self
                .inner
                .streams
                .get(&token.stream)
                .map(|s| s.clone())
                .ok_or_else(|| Error::Io(format!("unknown stream {}", token.stream)))?;
            let info = stream.info().await?;
            return Ok(RemoteStreamHandle::local(token, stream, info));
        }
        let info = stream::fetch_info(self, token).await?;
        Ok(RemoteStreamHandle::remote(token, self.clone(), info))
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").field("id", &self.id()).field("name", &self.name()).finish()
    }
}
