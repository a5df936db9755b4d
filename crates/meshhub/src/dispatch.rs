//! # Dispatch
//!
//! The per-connection worker and the handlers for every inbound packet.
//!
//! One worker reads a connection's frames in order and handles each packet
//! synchronously. Anything that may take time (evaluating a call, serving a
//! stream, forwarding through a busy route) is spawned so the worker keeps
//! reading.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use meshcall::CodecContext;
use meshcall::RemoteOnly;
use meshcall::codec;
use meshcall::eval;

use crate::awaiter::Completion;
use crate::config::ReconnectPolicy;
use crate::connection::Connection;
use crate::connection::ConnectionState;
use crate::connection::Role;
use crate::error::Error;
use crate::error::Result;
use crate::hub::Hub;
use crate::hub::this_param;
use crate::normalize::normalize;
use crate::packet::HubId;
use crate::packet::InterfaceLink;
use crate::packet::Packet;
use crate::packet::error_code;
use crate::stream;
use crate::topology::RemoteHub;

/// Reads and handles frames until the connection closes, then cleans up.
pub(crate) async fn run(hub: Hub, conn: Arc<Connection>) {
    let transport = conn.transport();
    let outcome = loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => break Ok(()),
            frame = transport.recv() => frame,
        };
        match frame {
            Ok(Some(bytes)) => {
                conn.touch();
                if let Err(e) = Packet::decode(&bytes).and_then(|p| handle(&hub, &conn, p)) {
                    break Err(e);
                }
            }
            Ok(None) if conn.is_intentional() || conn.state() == ConnectionState::Disconnecting => break Ok(()),
            Ok(None) => break Err(Error::Connection("peer closed the transport".into())),
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(()) => conn.close(),
        Err(e) => {
            if matches!(e, Error::Protocol(_) | Error::Pack(_)) {
                send_quietly(&conn, &Packet::Error { code: error_code::PROTOCOL, message: e.to_string() });
            }
            conn.fail(e);
        }
    }
    connection_lost(&hub, &conn);
}

fn handle(hub: &Hub, conn: &Arc<Connection>, packet: Packet) -> Result<()> {
    tracing::trace!(hub = %hub.id(), peer = %conn.peer(), kind = packet.kind(), "packet");
    match packet {
        Packet::Hello { hub: id, name } => on_hello(hub, conn, id, name),
        Packet::HelloResponse { hub: id, name } => on_hello_response(hub, conn, id, name),
        Packet::Error { code, message } => on_error(conn, code, message),
        Packet::Disconnect => {
            send_quietly(conn, &Packet::ReadyForDisconnect);
            conn.mark_intentional();
            conn.close();
            Ok(())
        }
        Packet::ReadyForDisconnect => {
            if conn.state() != ConnectionState::Disconnecting {
                return Err(Error::Protocol("ReadyForDisconnect without Disconnect".into()));
            }
            conn.close();
            Ok(())
        }
        other if !conn.is_active() => Err(Error::Protocol(format!("{} before handshake", other.kind()))),
        Packet::HubIsAvailable { hub: id, name, distance } => on_hub_available(hub, conn, id, name, distance),
        Packet::HubIsUnavailable { hub: id } => on_hub_unavailable(hub, conn, id),
        Packet::RegisterInterface { name, links } => on_register_interface(hub, conn, name, links),
        Packet::UnregisterInterface { name, hub: id } => on_unregister_interface(hub, conn, name, id),
        Packet::RetransmitTo { receiver, sender, packet } => on_retransmit(hub, conn, receiver, sender, packet),
        other => Err(Error::Protocol(format!("{} outside an envelope", other.kind()))),
    }
}

// ==== HANDSHAKE ====

fn reject_collision(hub: &Hub, conn: &Connection, id: HubId) -> Result<()> {
    let message = format!("hub id {} is already in use by {}", id, hub.name());
    send_quietly(conn, &Packet::Error { code: error_code::HUB_ID_COLLISION, message: message.clone() });
    conn.fail(Error::Protocol(message));
    Ok(())
}

fn on_hello(hub: &Hub, conn: &Arc<Connection>, id: HubId, name: String) -> Result<()> {
    if conn.role() != Role::Acceptor || conn.state() != ConnectionState::NotInitialized {
        return Err(Error::Protocol(format!("Hello in state {:?}", conn.state())));
    }
    if id == hub.id() {
        return reject_collision(hub, conn, id);
    }
    conn.set_remote(id, name);
    conn.send(&Packet::HelloResponse { hub: hub.id(), name: hub.name().to_string() })?;
    established(hub, conn)?;
    conn.set_state(ConnectionState::Active);
    Ok(())
}

fn on_hello_response(hub: &Hub, conn: &Arc<Connection>, id: HubId, name: String) -> Result<()> {
    if conn.state() != ConnectionState::HelloSent {
        return Err(Error::Protocol(format!("HelloResponse in state {:?}", conn.state())));
    }
    if id == hub.id() {
        return reject_collision(hub, conn, id);
    }
    conn.set_remote(id, name);
    established(hub, conn)?;
    conn.set_state(ConnectionState::Active);
    Ok(())
}

fn on_error(conn: &Connection, code: i32, message: String) -> Result<()> {
    let fatal = !conn.is_active() || code == error_code::PROTOCOL || code == error_code::HUB_ID_COLLISION;
    if !fatal {
        tracing::warn!(peer = %conn.peer(), code, message = %message, "peer reported error");
        return Ok(());
    }
    let error = match code {
        error_code::HUB_ID_COLLISION => Error::Protocol(format!("hub id collision: {}", message)),
        _ => Error::Protocol(format!("peer error {}: {}", code, message)),
    };
    conn.fail(error);
    Ok(())
}

/// Registers the new peer and brings it up to date.
fn established(hub: &Hub, conn: &Arc<Connection>) -> Result<()> {
    let Some((peer, name)) = conn.remote() else {
        return Err(Error::Protocol("handshake without a remote hub".into()));
    };
    let own = hub.id();
    let relay = hub.config().relay;
    let others = hub.active_connections();

    let mut mesh = hub.inner.mesh.lock();
    conn.learn(peer);
    conn.mark_announced(peer);
    let improved = mesh.topology.distance(peer).is_some_and(|d| d > 0);
    mesh.topology.add_route(peer, &name, conn, 0);

    if relay {
        let announce = Packet::HubIsAvailable { hub: peer, name: name.clone(), distance: 1 };
        announce_to_others(conn, &others, peer, &announce, improved);
        for remote in mesh.topology.iter() {
            if remote.id == peer || !conn.mark_announced(remote.id) {
                continue;
            }
            let distance = remote.connections.min_distance().unwrap_or(0) + 1;
            conn.send(&Packet::HubIsAvailable { hub: remote.id, name: remote.name.clone(), distance })?;
        }
    }

    for iface in mesh.interfaces.iter() {
        let links: Vec<InterfaceLink> = if relay {
            iface.entries(own)
        } else {
            iface
                .local
                .iter()
                .map(|l| InterfaceLink { hub: own, id: l.id, version: l.version })
                .collect()
        };
        for packet in link_packets(&iface.name, &links) {
            conn.send(&packet)?;
        }
    }
    drop(mesh);

    tracing::info!(hub = %own, remote = %peer, remote_name = %name, peer = %conn.peer(), "connection established");
    Ok(())
}

// ==== TOPOLOGY ====

fn on_hub_available(hub: &Hub, conn: &Arc<Connection>, id: HubId, name: String, distance: i32) -> Result<()> {
    if id == hub.id() || conn.remote_id() == Some(id) {
        return Ok(());
    }
    let others = hub.active_connections();
    let mut mesh = hub.inner.mesh.lock();
    let first_via_conn = conn.learn(id);
    let improved = mesh.topology.distance(id).is_some_and(|d| distance < d);
    let fresh = mesh.topology.add_route(id, &name, conn, distance);
    if !first_via_conn && !improved {
        return Ok(());
    }
    tracing::debug!(hub = %hub.id(), remote = %id, distance, improved, peer = %conn.peer(), "hub available");

    if hub.config().relay && (fresh || improved) {
        let announce = Packet::HubIsAvailable { hub: id, name, distance: distance + 1 };
        announce_to_others(conn, &others, id, &announce, improved);
    }
    Ok(())
}

/// Announces `hub` on every connection except the one it arrived on and the
/// hub's own. Connections that already heard of it only get the announcement
/// again when the route got shorter.
fn announce_to_others(arrival: &Connection, others: &[Arc<Connection>], hub: HubId, announce: &Packet, improved: bool) {
    for other in others {
        if other.id() == arrival.id() || other.remote_id() == Some(hub) {
            continue;
        }
        if other.mark_announced(hub) || improved {
            send_quietly(other, announce);
        }
    }
}

fn on_hub_unavailable(hub: &Hub, conn: &Arc<Connection>, id: HubId) -> Result<()> {
    if !conn.unlearn(id) {
        return Ok(());
    }
    let others = hub.active_connections();
    let lost = {
        let mut mesh = hub.inner.mesh.lock();
        let lost = mesh.topology.remove_route(id, conn.id());
        if lost.is_some() {
            mesh.interfaces.drop_hub(id);
        }
        lost
    };
    tracing::debug!(hub = %hub.id(), remote = %id, reachable = lost.is_none(), "route withdrawn");
    if let Some(remote) = lost {
        hubs_lost(hub, vec![remote], &others);
    }
    Ok(())
}

/// Withdraws hubs that are no longer reachable from every peer they were
/// announced to and fails the calls waiting on them.
fn hubs_lost(hub: &Hub, lost: Vec<RemoteHub>, conns: &[Arc<Connection>]) {
    for remote in lost {
        for conn in conns {
            if conn.withdraw_announced(remote.id) {
                send_quietly(conn, &Packet::HubIsUnavailable { hub: remote.id });
            }
        }
        let failed = hub.inner.awaiters.fail_hub(remote.id);
        tracing::info!(hub = %hub.id(), remote = %remote.id, remote_name = %remote.name, failed, "hub unavailable");
    }
}

// ==== INTERFACES ====

/// `RegisterInterface` packets for `links`, split to the one-byte count limit.
pub(crate) fn link_packets(name: &str, links: &[InterfaceLink]) -> Vec<Packet> {
    links
        .chunks(u8::MAX as usize)
        .map(|chunk| Packet::RegisterInterface { name: name.to_string(), links: chunk.to_vec() })
        .collect()
}

pub(crate) fn send_links(conn: &Connection, name: &str, links: &[InterfaceLink]) {
    for packet in link_packets(name, links) {
        send_quietly(conn, &packet);
    }
}

fn on_register_interface(hub: &Hub, conn: &Arc<Connection>, name: String, links: Vec<InterfaceLink>) -> Result<()> {
    let own = hub.id();
    let others = hub.active_connections();
    let fresh = {
        let mut mesh = hub.inner.mesh.lock();
        let known: Vec<InterfaceLink> = links
            .iter()
            .filter(|l| l.hub != own && mesh.topology.contains(l.hub))
            .copied()
            .collect();
        let fresh = mesh.interfaces.merge(&name, &known);
        for link in &fresh {
            if let Some(remote) = mesh.topology.get_mut(link.hub) {
                remote.interfaces.insert(name.clone());
            }
        }
        fresh
    };
    if fresh.is_empty() {
        return Ok(());
    }
    tracing::debug!(hub = %own, interface = %name, links = fresh.len(), "interface links learned");

    if hub.config().relay {
        let forward = if fresh.len() == links.len() { &links } else { &fresh };
        for other in others.iter().filter(|o| o.id() != conn.id()) {
            send_links(other, &name, forward);
        }
    }
    Ok(())
}

fn on_unregister_interface(hub: &Hub, conn: &Arc<Connection>, name: String, id: HubId) -> Result<()> {
    let others = hub.active_connections();
    let removed = {
        let mut mesh = hub.inner.mesh.lock();
        let removed = mesh.interfaces.remove_link(&name, id);
        if removed {
            if let Some(remote) = mesh.topology.get_mut(id) {
                remote.interfaces.remove(&name);
            }
        }
        removed
    };
    if !removed {
        return Ok(());
    }
    tracing::debug!(hub = %hub.id(), interface = %name, remote = %id, "interface link withdrawn");
    if hub.config().relay {
        let packet = Packet::UnregisterInterface { name, hub: id };
        for other in others.iter().filter(|o| o.id() != conn.id()) {
            send_quietly(other, &packet);
        }
    }
    Ok(())
}

// ==== RETRANSMISSION ====

fn on_retransmit(hub: &Hub, conn: &Arc<Connection>, receiver: HubId, sender: HubId, packet: Vec<u8>) -> Result<()> {
    if receiver == hub.id() {
        return deliver(hub, conn, sender, Packet::decode(&packet)?);
    }
    if !hub.config().relay {
        let message = format!("hub {} does not relay", hub.id());
        return refuse(hub, conn, sender, &packet, error_code::NOT_RELAYING, message);
    }
    let route = hub.inner.mesh.lock().topology.route(receiver);
    let Some(route) = route else {
        let message = format!("hub {} is unknown to {}", receiver, hub.id());
        return refuse(hub, conn, sender, &packet, error_code::UNKNOWN_HUB, message);
    };

    tracing::debug!(hub = %hub.id(), receiver = %receiver, sender = %sender, "relaying");
    let hub = hub.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let envelope = Packet::RetransmitTo { receiver, sender, packet };
        let sent = match route.select(hub.config().acquire_timeout).await {
            Ok(lease) => lease.send(&envelope),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            let Packet::RetransmitTo { packet, .. } = envelope else { return };
            if let Err(e) = refuse(&hub, &conn, sender, &packet, error_code::UNKNOWN_HUB, e.to_string()) {
                tracing::debug!(peer = %conn.peer(), error = %e, "relay refusal not sent");
            }
        }
    });
    Ok(())
}

/// Answers an undeliverable envelope: requests get an `Exception` routed back
/// to their sender, anything else an `Error` to the previous hop.
fn refuse(hub: &Hub, conn: &Connection, sender: HubId, inner: &[u8], code: i32, message: String) -> Result<()> {
    tracing::warn!(hub = %hub.id(), sender = %sender, code, message = %message, "refusing retransmission");
    if let Ok(request) = Packet::decode(inner) {
        if let (true, Some(await_id)) = (request.is_request(), request.await_id()) {
            let reply = Packet::Exception { await_id, message }.encode()?;
            return conn.send(&Packet::RetransmitTo { receiver: sender, sender: hub.id(), packet: reply });
        }
    }
    conn.send(&Packet::Error { code, message })
}

fn deliver(hub: &Hub, conn: &Arc<Connection>, sender: HubId, packet: Packet) -> Result<()> {
    match packet {
        Packet::Call { await_id, interface, descriptor } => {
            tokio::spawn(execute_call(hub.clone(), conn.clone(), sender, await_id, interface, descriptor));
        }
        Packet::Result { await_id, value } => complete(hub, await_id, Completion::Value(value)),
        Packet::Exception { await_id, message } => complete(hub, await_id, Completion::Exception(message)),
        Packet::StreamInfo { await_id, length, position, flags } => {
            complete(hub, await_id, Completion::StreamInfo { length, position, flags })
        }
        Packet::StreamData { await_id, data } => complete(hub, await_id, Completion::StreamData(data)),
        Packet::StreamAck { await_id, position } => complete(hub, await_id, Completion::StreamAck(position)),
        request if request.is_request() => {
            tokio::spawn(serve_stream(hub.clone(), conn.clone(), sender, request));
        }
        other => return Err(Error::Protocol(format!("{} cannot be retransmitted", other.kind()))),
    }
    Ok(())
}

fn complete(hub: &Hub, await_id: i32, completion: Completion) {
    if !hub.inner.awaiters.complete(await_id, Ok(completion)) {
        tracing::warn!(hub = %hub.id(), await_id, "reply for unknown awaiter dropped");
    }
}

async fn execute_call(hub: Hub, conn: Arc<Connection>, sender: HubId, await_id: i32, interface: u32, bytes: Vec<u8>) {
    let reply = match run_call(&hub, &conn, interface, &bytes).await {
        Ok(value) => Packet::Result { await_id, value },
        Err(e) => {
            tracing::debug!(hub = %hub.id(), await_id, error = %e, "call failed");
            Packet::Exception { await_id, message: e.to_string() }
        }
    };
    if let Err(e) = reply_to(&hub, &conn, sender, reply).await {
        tracing::warn!(hub = %hub.id(), sender = %sender, await_id, error = %e, "reply not delivered");
    }
}

/// Decodes, evaluates and encodes one call against the local implementation.
async fn run_call(hub: &Hub, conn: &Connection, interface: u32, bytes: &[u8]) -> Result<Vec<u8>> {
    let (name, target) = {
        let mesh = hub.inner.mesh.lock();
        let (name, local) = mesh
            .interfaces
            .local(interface)
            .ok_or_else(|| Error::UnknownInterface(format!("#{}", interface)))?;
        (name.to_string(), local.target.clone())
    };
    let catalog = &hub.config().catalog;
    let this = this_param(&name);
    let value = {
        let ctx = CodecContext::new(conn.registry(), catalog);
        let mut scope = vec![this.clone()];
        let descriptor = codec::decode(ctx, bytes, &mut scope)?;
        eval::evaluate(&descriptor, &[(this, target)], catalog, &RemoteOnly)?
    };
    let value = normalize(value).await?;
    let ctx = CodecContext::new(conn.registry(), catalog);
    Ok(codec::value_to_bytes(ctx, &value)?)
}

async fn serve_stream(hub: Hub, conn: Arc<Connection>, sender: HubId, request: Packet) {
    let id = match &request {
        Packet::StreamInfoRequest { stream, .. }
        | Packet::StreamRead { stream, .. }
        | Packet::StreamWrite { stream, .. }
        | Packet::StreamSeek { stream, .. }
        | Packet::StreamClose { stream, .. } => *stream,
        _ => return,
    };
    let closing = matches!(request, Packet::StreamClose { .. });
    let local = hub.inner.streams.get(&id).map(|s| s.clone());
    let Some(reply) = stream::serve(local, request).await else { return };
    if closing {
        hub.unexpose_stream(id);
    }
    if let Err(e) = reply_to(&hub, &conn, sender, reply).await {
        tracing::warn!(hub = %hub.id(), sender = %sender, stream = id, error = %e, "stream reply not delivered");
    }
}

/// Sends a reply back to `receiver`, through the connection the request came
/// in on while it is still up, otherwise along any route.
async fn reply_to(hub: &Hub, conn: &Connection, receiver: HubId, reply: Packet) -> Result<()> {
    let own = hub.id();
    let envelope = match wrap(own, receiver, &reply) {
        Ok(envelope) => envelope,
        Err(e) => {
            let await_id = reply.await_id().unwrap_or_default();
            wrap(own, receiver, &Packet::Exception { await_id, message: e.to_string() })?
        }
    };
    if conn.is_active() {
        return conn.send(&envelope);
    }
    let route = hub.inner.mesh.lock().topology.route(receiver);
    let route = route.ok_or(Error::UnknownHub(receiver))?;
    let lease = route.select(hub.config().acquire_timeout).await?;
    lease.send(&envelope)
}

fn wrap(own: HubId, receiver: HubId, packet: &Packet) -> Result<Packet> {
    let envelope = Packet::RetransmitTo { receiver, sender: own, packet: packet.encode()? };
    envelope.encode()?;
    Ok(envelope)
}

// ==== TEARDOWN ====

pub(crate) fn send_quietly(conn: &Connection, packet: &Packet) {
    if let Err(e) = conn.send(packet) {
        tracing::debug!(peer = %conn.peer(), kind = packet.kind(), error = %e, "send skipped");
    }
}

/// Forgets a closed connection and everything only it could reach.
fn connection_lost(hub: &Hub, conn: &Arc<Connection>) {
    hub.inner.connections.remove(&conn.id());
    let others = hub.active_connections();
    let lost = {
        let mut mesh = hub.inner.mesh.lock();
        let lost = mesh.topology.drop_connection(conn.id());
        for remote in &lost {
            mesh.interfaces.drop_hub(remote.id);
        }
        lost
    };
    tracing::info!(
        hub = %hub.id(),
        peer = %conn.peer(),
        remote = ?conn.remote_id(),
        lost = lost.len(),
        "connection closed"
    );
    hubs_lost(hub, lost, &others);

    if let Some((addr, policy)) = conn.reconnect() {
        if !conn.is_intentional() && !hub.is_shutting_down() {
            tokio::spawn(reconnect(hub.clone(), addr, policy));
        }
    }
}

fn reconnect(hub: Hub, addr: SocketAddr, policy: ReconnectPolicy) -> BoxFuture<'static, ()> {
    async move {
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
            if hub.is_shutting_down() {
                return;
            }
            match hub.dial(addr, Some(policy)).await {
                Ok(conn) => {
                    tracing::info!(hub = %hub.id(), addr = %addr, attempt, peer = %conn.peer(), "reconnected");
                    return;
                }
                Err(e) => tracing::warn!(hub = %hub.id(), addr = %addr, attempt, error = %e, "reconnect failed"),
            }
        }
        tracing::error!(hub = %hub.id(), addr = %addr, attempts = policy.max_attempts, "giving up on reconnect");
    }
    .boxed()
}
