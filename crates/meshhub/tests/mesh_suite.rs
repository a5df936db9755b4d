//! End-to-end mesh tests: topology, routing, calls, streams.

use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use meshcall::Catalog;
use meshcall::Descriptor;
use meshcall::FromValue;
use meshcall::TypeTag;
use meshcall::Value;
use meshhub::Error;
use meshhub::Hub;
use meshhub::InterfaceHandle;
use meshhub::MemoryStream;
use meshhub::mock_transport::DuplexChannelTransport;

const CALC: &str = "demo.Calc";

// ============================================================================
//  FIXTURES
// ============================================================================

struct Calc {
    version: i32,
    hits: AtomicI32,
}

fn calc_ty() -> TypeTag {
    TypeTag::external(CALC)
}

fn catalog() -> Arc<Catalog> {
    let mut catalog = Catalog::with_builtins();
    catalog
        .define::<Calc>(CALC)
        .method("Add", &[TypeTag::I32, TypeTag::I32], TypeTag::I32, |c, args| {
            c.hits.fetch_add(1, Ordering::SeqCst);
            let a = i32::from_value(args[0].clone())?;
            let b = i32::from_value(args[1].clone())?;
            Ok(Value::I32(a + b))
        })
        .method("Version", &[], TypeTag::I32, |c, _| Ok(Value::I32(c.version)))
        .local_method("Reset", &[], TypeTag::Void, |c, _| {
            c.hits.store(0, Ordering::SeqCst);
            Ok(Value::Unit)
        })
        .method("Later", &[TypeTag::I32], TypeTag::I32, |_, args| {
            let v = i32::from_value(args[0].clone())?;
            Ok(Value::pending(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Value::I32(v * 2))
            }))
        })
        .method("Slow", &[], TypeTag::I32, |_, _| {
            Ok(Value::pending(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::I32(0))
            }))
        })
        .method("Range", &[TypeTag::I32], TypeTag::array(TypeTag::I32), |_, args| {
            let n = i32::from_value(args[0].clone())?;
            Ok(Value::sequence(TypeTag::I32, (0..n).map(Value::I32)))
        })
        .method("Fail", &[], TypeTag::I32, |_, _| Err(meshcall::Error::Invocation("boom".into())))
        .property("Hits", TypeTag::I32, |c| Value::I32(c.hits.load(Ordering::SeqCst)));
    Arc::new(catalog)
}

fn calc(version: i32) -> Value {
    Value::object(CALC, Calc { version, hits: AtomicI32::new(0) })
}

fn hub(catalog: &Arc<Catalog>, name: &str, relay: bool) -> Hub {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Hub::builder(name)
        .relay(relay)
        .shared_catalog(catalog.clone())
        .handshake_timeout(Duration::from_secs(2))
        .disconnect_timeout(Duration::from_secs(2))
        .call_timeout(Duration::from_secs(5))
        .build()
}

/// Opens an in-memory session from `a` to `b`.
async fn link(a: &Hub, b: &Hub) -> Result<u64> {
    let (ta, tb) = DuplexChannelTransport::pair(a.name(), b.name());
    b.accept_transport(Arc::new(tb));
    Ok(a.connect_transport(Arc::new(ta)).await?.id())
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

async fn resolve(hub: &Hub, name: &str) -> Result<InterfaceHandle> {
    eventually("interface resolves", || hub.interface(name).is_ok()).await?;
    Ok(hub.interface(name)?)
}

fn sorted(mut ids: Vec<i64>) -> Vec<i64> {
    ids.sort_unstable();
    ids
}

fn call(handle: &InterfaceHandle, method: &str, args: Vec<Descriptor>) -> Descriptor {
    Descriptor::call(Descriptor::param(&handle.this()), calc_ty(), method, args)
}

fn int(v: i32) -> Descriptor {
    Descriptor::constant(v)
}

/// A, B and C with A–B and B–C sessions.
async fn chain(relay: bool) -> Result<(Hub, Hub, Hub)> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    let b = hub(&catalog, "b", relay);
    let c = hub(&catalog, "c", false);
    link(&a, &b).await?;
    link(&c, &b).await?;
    Ok((a, b, c))
}

// ============================================================================
//  TOPOLOGY
// ============================================================================

#[tokio::test]
async fn test_relay_chain_propagates_topology() -> Result<()> {
    let (a, b, c) = chain(true).await?;
    eventually("a sees b and c", || a.known_hubs() == sorted(vec![b.id(), c.id()])).await?;
    eventually("c sees a and b", || c.known_hubs() == sorted(vec![a.id(), b.id()])).await?;
    assert_eq!(b.known_hubs(), sorted(vec![a.id(), c.id()]));

    let far = a.remote_hub(c.id()).ok_or_else(|| anyhow::anyhow!("c unknown to a"))?;
    assert_eq!(far.distances, vec![1]);
    assert_eq!(far.name, "c");
    Ok(())
}

#[tokio::test]
async fn test_shorter_route_is_announced_downstream() -> Result<()> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    let b = hub(&catalog, "b", true);
    let c = hub(&catalog, "c", true);
    let d = hub(&catalog, "d", true);
    let e = hub(&catalog, "e", false);
    link(&a, &b).await?;
    link(&c, &b).await?;
    link(&d, &c).await?;
    link(&e, &d).await?;

    let distances = |from: &Hub, to: &Hub| from.remote_hub(to.id()).map(|r| r.distances);
    eventually("e sees a three hops out", || distances(&e, &a) == Some(vec![3])).await?;
    assert_eq!(distances(&e, &b), Some(vec![2]));

    // A shortcut between b and d shortens every route through d.
    link(&d, &b).await?;
    eventually("e hears the shorter route to a", || distances(&e, &a) == Some(vec![2])).await?;
    eventually("e hears the shorter route to b", || distances(&e, &b) == Some(vec![1])).await?;
    eventually("a hears the shorter route to d", || distances(&a, &d) == Some(vec![1])).await?;
    eventually("c keeps its direct route to a", || distances(&c, &a) == Some(vec![1, 2])).await?;
    Ok(())
}

#[tokio::test]
async fn test_non_relay_keeps_neighbors_apart() -> Result<()> {
    let (a, b, c) = chain(false).await?;
    eventually("b sees both", || b.known_hubs() == sorted(vec![a.id(), c.id()])).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.known_hubs(), vec![b.id()]);
    assert_eq!(c.known_hubs(), vec![b.id()]);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_cascades_unavailability() -> Result<()> {
    let (a, b, c) = chain(true).await?;
    eventually("a sees c", || a.known_hubs().contains(&c.id())).await?;

    let to_c = b
        .connections()
        .into_iter()
        .find(|i| i.remote.as_ref().map(|r| r.0) == Some(c.id()))
        .ok_or_else(|| anyhow::anyhow!("b has no connection to c"))?;
    b.disconnect(to_c.id).await?;

    eventually("a forgets c", || a.known_hubs() == vec![b.id()]).await?;
    eventually("b forgets c", || b.known_hubs() == vec![a.id()]).await?;
    eventually("c is alone", || c.known_hubs().is_empty()).await?;
    assert_eq!(a.remote_hub(b.id()).map(|r| r.distances), Some(vec![0]));
    Ok(())
}

#[tokio::test]
async fn test_late_joiner_receives_directory() -> Result<()> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    let b = hub(&catalog, "b", false);
    a.register_interface(CALC, 1, calc(1))?;
    link(&b, &a).await?;

    let handle = resolve(&b, CALC).await?;
    assert_eq!(handle.hub_id(), a.id());
    let info = b.remote_hub(a.id()).ok_or_else(|| anyhow::anyhow!("a unknown"))?;
    assert_eq!(info.interfaces, vec![CALC.to_string()]);
    Ok(())
}

// ============================================================================
//  CALLS
// ============================================================================

#[tokio::test]
async fn test_multi_hop_call_through_relay() -> Result<()> {
    let (a, _b, c) = chain(true).await?;
    a.register_interface(CALC, 1, calc(1))?;

    let handle = resolve(&c, CALC).await?;
    assert!(!handle.is_local());
    assert_eq!(handle.hub_id(), a.id());
    assert_eq!(handle.call_as::<i32>(&call(&handle, "Add", vec![int(40), int(2)])).await?, 42);
    assert_eq!(c.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_correlate() -> Result<()> {
    let (a, _b, c) = chain(true).await?;
    a.register_interface(CALC, 1, calc(1))?;
    let handle = resolve(&c, CALC).await?;

    let calls = (0..32).map(|i| {
        let handle = handle.clone();
        async move {
            let d = call(&handle, "Later", vec![int(i)]);
            handle.call_as::<i32>(&d).await
        }
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result?, i as i32 * 2);
    }
    Ok(())
}

#[tokio::test]
async fn test_version_routing() -> Result<()> {
    let catalog = catalog();
    let x = hub(&catalog, "x", false);
    let v1 = hub(&catalog, "v1", false);
    let v2 = hub(&catalog, "v2", false);
    v1.register_interface(CALC, 1, calc(1))?;
    v2.register_interface(CALC, 2, calc(2))?;
    link(&x, &v1).await?;
    link(&x, &v2).await?;
    eventually("both providers known", || {
        x.interfaces().iter().any(|i| i.name == CALC && i.links.len() == 2)
    })
    .await?;

    let handle = x.interface_version(CALC, 2)?;
    assert_eq!(handle.hub_id(), v2.id());
    assert_eq!(handle.call_as::<i32>(&call(&handle, "Version", vec![])).await?, 2);

    let handle = x.interface_version(CALC, 1)?;
    assert_eq!(handle.call_as::<i32>(&call(&handle, "Version", vec![])).await?, 1);

    assert!(matches!(x.interface_version(CALC, 3), Err(Error::UnknownInterface(_))));
    Ok(())
}

#[tokio::test]
async fn test_remote_access_denied_has_no_side_effect() -> Result<()> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    let b = hub(&catalog, "b", false);
    a.register_interface(CALC, 1, calc(1))?;
    link(&b, &a).await?;

    let remote = resolve(&b, CALC).await?;
    remote.call(&call(&remote, "Add", vec![int(1), int(1)])).await?;

    let denied = remote.call(&call(&remote, "Reset", vec![])).await;
    assert!(matches!(&denied, Err(Error::RemoteExecution(m)) if m.contains("Access denied")), "got {:?}", denied.err());

    let hits = Descriptor::member(Descriptor::param(&remote.this()), calc_ty(), "Hits");
    assert_eq!(remote.call_as::<i32>(&hits).await?, 1);

    let local = a.interface(CALC)?;
    assert!(local.is_local());
    local.call(&call(&local, "Reset", vec![])).await?;
    assert_eq!(local.call_as::<i32>(&hits).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_results_are_normalized() -> Result<()> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    let b = hub(&catalog, "b", false);
    a.register_interface(CALC, 1, calc(1))?;
    link(&b, &a).await?;
    let remote = resolve(&b, CALC).await?;

    assert_eq!(remote.call_as::<i32>(&call(&remote, "Later", vec![int(21)])).await?, 42);
    assert_eq!(remote.call_as::<Vec<i32>>(&call(&remote, "Range", vec![int(4)])).await?, vec![0, 1, 2, 3]);

    let failed = remote.call(&call(&remote, "Fail", vec![])).await;
    assert_eq!(failed.err(), Some(Error::RemoteExecution("boom".into())));
    Ok(())
}

#[tokio::test]
async fn test_calls_fail_fast_when_hub_leaves() -> Result<()> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    let b = hub(&catalog, "b", false);
    b.register_interface(CALC, 1, calc(1))?;
    link(&a, &b).await?;
    let remote = resolve(&a, CALC).await?;

    let slow = call(&remote, "Slow", vec![]);
    let pending = tokio::spawn(async move { remote.call(&slow).await.err() });
    eventually("call is outstanding", || a.pending_calls() == 1).await?;

    b.shutdown().await;
    let err = tokio::time::timeout(Duration::from_secs(2), pending).await??;
    assert_eq!(err, Some(Error::HubUnavailable(b.id())));
    assert_eq!(a.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_call_deadline() -> Result<()> {
    let catalog = catalog();
    let a = Hub::builder("a").shared_catalog(catalog.clone()).call_timeout(Duration::from_millis(100)).build();
    let b = hub(&catalog, "b", false);
    b.register_interface(CALC, 1, calc(1))?;
    link(&a, &b).await?;
    let remote = resolve(&a, CALC).await?;

    let err = remote.call(&call(&remote, "Slow", vec![])).await.err();
    assert_eq!(err, Some(Error::Timeout("call result")));
    assert_eq!(a.pending_calls(), 0);
    Ok(())
}

// ============================================================================
//  INTERFACE LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_unregister_propagates_through_relay() -> Result<()> {
    let (a, b, c) = chain(true).await?;
    a.register_interface(CALC, 1, calc(1))?;
    resolve(&c, CALC).await?;

    a.unregister_interface(CALC)?;
    eventually("c loses the link", || c.interface(CALC).is_err()).await?;
    eventually("b loses the link", || b.interface(CALC).is_err()).await?;
    assert!(matches!(a.interface(CALC), Err(Error::UnknownInterface(_))));
    assert!(matches!(a.unregister_interface(CALC), Err(Error::UnknownInterface(_))));

    a.register_interface(CALC, 2, calc(2))?;
    let handle = resolve(&c, CALC).await?;
    assert_eq!(handle.version(), 2);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_local_registration_is_rejected() -> Result<()> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    a.register_interface(CALC, 1, calc(1))?;
    assert!(a.register_interface(CALC, 2, calc(2)).is_err());
    Ok(())
}

// ============================================================================
//  TCP
// ============================================================================

#[tokio::test]
async fn test_call_over_tcp() -> Result<()> {
    let catalog = catalog();
    let a = hub(&catalog, "a", false);
    let b = hub(&catalog, "b", false);
    a.register_interface(CALC, 1, calc(1))?;
    let addr = a.listen("127.0.0.1:0".parse()?).await?;
    b.connect(addr).await?;

    let remote = resolve(&b, CALC).await?;
    assert_eq!(remote.call_as::<i32>(&call(&remote, "Add", vec![int(7), int(8)])).await?, 15);

    b.shutdown().await;
    eventually("a forgets b", || a.known_hubs().is_empty()).await?;
    a.shutdown().await;
    Ok(())
}

// ============================================================================
//  STREAMS
// ============================================================================

#[tokio::test]
async fn test_remote_stream_through_relay() -> Result<()> {
    let (a, _b, c) = chain(true).await?;
    eventually("c sees a", || c.known_hubs().contains(&a.id())).await?;

    let backing = Arc::new(MemoryStream::new(b"hello mesh".to_vec()));
    let token = a.expose_stream(backing.clone());

    let stream = c.open_stream(token).await?;
    assert_eq!(stream.cached_info().length, 10);
    assert!(stream.cached_info().can_seek());

    assert_eq!(stream.read(5).await?, b"hello");
    assert_eq!(stream.seek(6).await?, 6);
    assert_eq!(stream.write(b"MESH!").await?, 11);
    assert_eq!(stream.info().await?.length, 11);

    let big = vec![3u8; 150_000];
    stream.seek(0).await?;
    assert_eq!(stream.write(&big).await?, 150_000);
    stream.seek(0).await?;
    assert_eq!(stream.read(200_000).await?, big);

    stream.close().await?;
    assert!(backing.is_closed());
    assert!(matches!(c.open_stream(token).await, Err(Error::RemoteExecution(_))));
    Ok(())
}
