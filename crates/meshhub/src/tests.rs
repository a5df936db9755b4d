//! Connection-level tests over in-memory transports.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use meshcall::TypeRegistry;

use crate::config::ReconnectPolicy;
use crate::connection::Connection;
use crate::connection::ConnectionState;
use crate::connection::Role;
use crate::error::Error;
use crate::hub::Hub;
use crate::mock_transport::DuplexChannelTransport;
use crate::packet::Packet;
use crate::packet::error_code;
use crate::topology::ConnectionsContainer;
use crate::transport::Transport;

// ============================================================================
//  HELPERS
// ============================================================================

fn connection(id: u64) -> (Arc<Connection>, DuplexChannelTransport) {
    let (near, far) = DuplexChannelTransport::pair("near", "far");
    let conn = Connection::new(id, Role::Opener, Arc::new(near), Arc::new(TypeRegistry::new()), None);
    (conn, far)
}

fn active(id: u64) -> (Arc<Connection>, DuplexChannelTransport) {
    let (conn, far) = connection(id);
    conn.set_state(ConnectionState::Active);
    (conn, far)
}

fn hub(name: &str) -> Hub {
    Hub::builder(name)
        .handshake_timeout(Duration::from_millis(500))
        .disconnect_timeout(Duration::from_millis(500))
        .build()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..300 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("never observed: {}", what)
}

async fn next_packet(transport: &DuplexChannelTransport) -> Result<Packet> {
    let frame = tokio::time::timeout(Duration::from_secs(2), transport.recv())
        .await??
        .ok_or_else(|| anyhow::anyhow!("transport closed"))?;
    Ok(Packet::decode(&frame)?)
}

// ============================================================================
//  ROUTE SELECTION
// ============================================================================

#[tokio::test]
async fn test_select_prefers_shortest_active_bucket() -> Result<()> {
    let (far, _t1) = active(1);
    let (idle, _t2) = connection(2);
    let (near, _t3) = active(3);

    let mut container = ConnectionsContainer::default();
    container.insert(&far, 2);
    container.insert(&idle, 0);
    container.insert(&near, 1);
    assert_eq!(container.distances(), vec![0, 1, 2]);

    let route = container.snapshot();
    let first = route.select(Duration::from_millis(50)).await?;
    assert_eq!(first.connection().id(), 3);

    let second = route.select(Duration::from_millis(50)).await?;
    assert_eq!(second.connection().id(), 1);

    let third = route.select(Duration::from_millis(50)).await;
    assert_eq!(third.err(), Some(Error::Timeout("connection lease")));

    drop(first);
    let again = route.select(Duration::from_millis(50)).await?;
    assert_eq!(again.connection().id(), 3);
    Ok(())
}

#[tokio::test]
async fn test_select_never_returns_inactive() -> Result<()> {
    let (idle, _t) = connection(1);
    let mut container = ConnectionsContainer::default();
    container.insert(&idle, 0);
    let selected = container.snapshot().select(Duration::from_millis(20)).await;
    assert!(matches!(selected, Err(Error::Connection(_))));

    container.insert(&idle, 3);
    assert_eq!(container.len(), 1);
    assert_eq!(container.min_distance(), Some(3));
    assert!(container.remove(1));
    assert!(container.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_blocked_select_wakes_when_lease_returns() -> Result<()> {
    let (only, _t) = active(1);
    let mut container = ConnectionsContainer::default();
    container.insert(&only, 0);
    let route = container.snapshot();

    let held = route.select(Duration::from_millis(50)).await?;
    let waiter = tokio::spawn({
        let route = route.clone();
        async move { route.select(Duration::from_secs(2)).await.map(|l| l.connection().id()) }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);
    assert_eq!(waiter.await?, Ok(1));
    Ok(())
}

// ============================================================================
//  FRAMING GUARD
// ============================================================================

#[tokio::test]
async fn test_oversized_packet_never_reaches_transport() -> Result<()> {
    let (near, far) = DuplexChannelTransport::pair("near", "far");
    let sent = near.sent_counter();
    let conn = Connection::new(1, Role::Opener, Arc::new(near), Arc::new(TypeRegistry::new()), None);

    let big = Packet::Result { await_id: 1, value: vec![7; 70_000] };
    assert!(matches!(conn.send(&big), Err(Error::PacketTooLarge(_))));

    let almost = Packet::Result { await_id: 2, value: vec![7; u16::MAX as usize - 5] };
    assert!(matches!(conn.send(&almost), Err(Error::PacketTooLarge(_))));

    conn.send(&Packet::Disconnect)?;
    assert_eq!(next_packet(&far).await?, Packet::Disconnect);
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    assert_eq!(conn.info().write_seq, 1);
    Ok(())
}

// ============================================================================
//  HANDSHAKE
// ============================================================================

#[tokio::test]
async fn test_handshake_registers_both_sides() -> Result<()> {
    let a = hub("a");
    let b = hub("b");
    let (ta, tb) = DuplexChannelTransport::pair("a", "b");
    b.accept_transport(Arc::new(tb));
    let conn = a.connect_transport(Arc::new(ta)).await?;

    assert!(conn.is_active());
    assert_eq!(conn.remote(), Some((b.id(), "b".to_string())));
    assert_eq!(a.known_hubs(), vec![b.id()]);
    eventually("b learns a", || b.known_hubs() == vec![a.id()]).await?;

    let info = a.remote_hub(b.id()).ok_or_else(|| anyhow::anyhow!("b missing"))?;
    assert_eq!(info.distances, vec![0]);
    assert_eq!(info.name, "b");
    Ok(())
}

#[tokio::test]
async fn test_hub_id_collision_is_rejected() -> Result<()> {
    let a = Hub::builder("a").id(42).build();
    let b = Hub::builder("b").id(42).build();
    let (ta, tb) = DuplexChannelTransport::pair("a", "b");
    b.accept_transport(Arc::new(tb));

    let err = a.connect_transport(Arc::new(ta)).await.err();
    assert!(matches!(&err, Some(Error::Protocol(m)) if m.contains("collision")), "got {:?}", err);
    assert!(a.known_hubs().is_empty());
    eventually("b drops the connection", || b.connections().is_empty()).await?;
    Ok(())
}

#[tokio::test]
async fn test_handshake_times_out() -> Result<()> {
    let a = Hub::builder("a").handshake_timeout(Duration::from_millis(50)).build();
    let (ta, _silent) = DuplexChannelTransport::pair("a", "nobody");
    let err = a.connect_transport(Arc::new(ta)).await.err();
    assert_eq!(err, Some(Error::Timeout("handshake")));
    eventually("connection is forgotten", || a.connections().is_empty()).await?;
    Ok(())
}

#[tokio::test]
async fn test_packet_before_handshake_is_a_protocol_error() -> Result<()> {
    let b = hub("b");
    let (raw, tb) = DuplexChannelTransport::pair("raw", "b");
    b.accept_transport(Arc::new(tb));

    raw.send(&Packet::HubIsAvailable { hub: 9, name: "x".into(), distance: 0 }.encode()?).await?;
    match next_packet(&raw).await? {
        Packet::Error { code, .. } => assert_eq!(code, error_code::PROTOCOL),
        other => anyhow::bail!("expected Error, got {:?}", other),
    }
    eventually("connection is dropped", || b.connections().is_empty()).await?;
    assert!(b.known_hubs().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_packet_tag_is_fatal() -> Result<()> {
    let b = hub("b");
    let (raw, tb) = DuplexChannelTransport::pair("raw", "b");
    b.accept_transport(Arc::new(tb));

    raw.send(&Packet::Hello { hub: 5, name: "raw".into() }.encode()?).await?;
    assert!(matches!(next_packet(&raw).await?, Packet::HelloResponse { .. }));
    eventually("raw is known", || b.known_hubs() == vec![5]).await?;

    raw.send(&[0xEE, 1, 2]).await?;
    match next_packet(&raw).await? {
        Packet::Error { code, .. } => assert_eq!(code, error_code::PROTOCOL),
        other => anyhow::bail!("expected Error, got {:?}", other),
    }
    eventually("raw is forgotten", || b.known_hubs().is_empty()).await?;
    Ok(())
}

// ============================================================================
//  TEARDOWN
// ============================================================================

#[tokio::test]
async fn test_cooperative_disconnect() -> Result<()> {
    let a = hub("a");
    let b = hub("b");
    let (ta, tb) = DuplexChannelTransport::pair("a", "b");
    b.accept_transport(Arc::new(tb));
    let conn = a.connect_transport(Arc::new(ta)).await?;

    a.disconnect(conn.id()).await?;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(conn.failure().is_none());
    eventually("a forgets b", || a.known_hubs().is_empty()).await?;
    eventually("b forgets a", || b.known_hubs().is_empty() && b.connections().is_empty()).await?;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_times_out_without_reply() -> Result<()> {
    let a = Hub::builder("a").disconnect_timeout(Duration::from_millis(50)).build();
    let (ta, raw) = DuplexChannelTransport::pair("a", "raw");
    let connecting = tokio::spawn({
        let a = a.clone();
        async move { a.connect_transport(Arc::new(ta)).await }
    });
    assert!(matches!(next_packet(&raw).await?, Packet::Hello { .. }));
    raw.send(&Packet::HelloResponse { hub: 77, name: "raw".into() }.encode()?).await?;
    let conn = connecting.await??;

    assert_eq!(a.disconnect(conn.id()).await, Err(Error::Timeout("ReadyForDisconnect")));
    assert_eq!(next_packet(&raw).await?, Packet::Disconnect);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_unexpected_loss_triggers_reconnect() -> Result<()> {
    let a = hub("a");
    let b = hub("b");
    let addr = a.listen("127.0.0.1:0".parse()?).await?;
    let policy = ReconnectPolicy { interval: Duration::from_millis(20), max_attempts: 20 };
    let first = b.connect_with(addr, policy).await?;
    eventually("a learns b", || a.known_hubs() == vec![b.id()]).await?;

    let accepted = a.connections().first().map(|c| c.id).ok_or_else(|| anyhow::anyhow!("no connection"))?;
    let conn = a.connection(accepted).ok_or_else(|| anyhow::anyhow!("connection vanished"))?;
    conn.fail(Error::Io("reset by test".into()));

    eventually("b sees the loss", || first.state() == ConnectionState::Disconnected).await?;
    assert!(first.failure().is_some());
    eventually("b reconnects", || {
        b.connections().iter().any(|c| c.id != first.id() && c.state == ConnectionState::Active)
    })
    .await?;
    eventually("a learns b again", || a.known_hubs() == vec![b.id()]).await?;

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
