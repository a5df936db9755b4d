//! # Topology
//!
//! What a hub knows about the rest of the mesh: every remote hub it can reach,
//! and through which of its own connections at which hop distance.
//!
//! ## Invariants
//!
//! - A `RemoteHub` exists exactly as long as it has at least one route.
//! - Route selection only ever hands out `Active` connections.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::connection::Lease;
use crate::error::Error;
use crate::error::Result;
use crate::packet::HubId;

/// A remote hub's connections grouped by hop distance.
#[derive(Default)]
pub struct ConnectionsContainer {
    buckets: BTreeMap<i32, Vec<Arc<Connection>>>,
}

impl ConnectionsContainer {
    /// Adds or moves a connection to `distance`.
    pub fn insert(&mut self, conn: &Arc<Connection>, distance: i32) {
        self.remove(conn.id());
        self.buckets.entry(distance).or_default().push(conn.clone());
    }

    pub fn remove(&mut self, id: ConnectionId) -> bool {
        let mut removed = false;
        self.buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|c| c.id() != id);
            removed |= bucket.len() != before;
            !bucket.is_empty()
        });
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.buckets.values().flatten().any(|c| c.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn min_distance(&self) -> Option<i32> {
        self.buckets.keys().next().copied()
    }

    /// One entry per connection, shortest first.
    pub fn distances(&self) -> Vec<i32> {
        self.buckets.iter().flat_map(|(d, b)| std::iter::repeat_n(*d, b.len())).collect()
    }

    /// Buckets in ascending distance, detached from the container.
    pub fn snapshot(&self) -> Route {
        Route { buckets: self.buckets.values().cloned().collect() }
    }
}

/// A detached copy of a remote hub's buckets, safe to use across `.await`.
#[derive(Clone, Default)]
pub struct Route {
    buckets: Vec<Vec<Arc<Connection>>>,
}

impl Route {
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Leases a connection toward the hub.
    ///
    /// Buckets are scanned from the shortest distance. Within a bucket a
    /// non-blocking acquire is tried in a rotation that starts at a random
    /// offset. If every active connection is busy, blocks on the closest one
    /// for at most `timeout`.
    pub async fn select(&self, timeout: Duration) -> Result<Lease> {
        for bucket in &self.buckets {
            if bucket.is_empty() {
                continue;
            }
            let start = rand::random::<usize>() % bucket.len();
            for i in 0..bucket.len() {
                let conn = &bucket[(start + i) % bucket.len()];
                if !conn.is_active() {
                    continue;
                }
                if let Some(lease) = conn.try_acquire() {
                    return Ok(lease);
                }
            }
        }

        let fallback = self
            .buckets
            .iter()
            .flatten()
            .find(|c| c.is_active())
            .ok_or_else(|| Error::Connection("no active route".into()))?;
        let lease = tokio::time::timeout(timeout, fallback.acquire())
            .await
            .map_err(|_| Error::Timeout("connection lease"))?;
        if !lease.connection().is_active() {
            return Err(Error::Closed);
        }
        Ok(lease)
    }
}

pub struct RemoteHub {
    pub id: HubId,
    pub name: String,
    pub connections: ConnectionsContainer,
    /// Interfaces this hub is known to provide.
    pub interfaces: BTreeSet<String>,
}

/// Point-in-time view of a remote hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHubInfo {
    pub id: HubId,
    pub name: String,
    pub distances: Vec<i32>,
    pub interfaces: Vec<String>,
}

#[derive(Default)]
pub struct Topology {
    hubs: HashMap<HubId, RemoteHub>,
}

impl Topology {
    /// Records that `hub` is reachable through `conn` at `distance`.
    /// Returns true when the hub was not known before.
    pub fn add_route(&mut self, hub: HubId, name: &str, conn: &Arc<Connection>, distance: i32) -> bool {
        let mut fresh = false;
        let entry = self.hubs.entry(hub).or_insert_with(|| {
            fresh = true;
            RemoteHub {
                id: hub,
                name: name.to_string(),
                connections: ConnectionsContainer::default(),
                interfaces: BTreeSet::new(),
            }
        });
        entry.connections.insert(conn, distance);
        fresh
    }

    /// Removes one route. Returns the hub if it is no longer reachable.
    pub fn remove_route(&mut self, hub: HubId, conn: ConnectionId) -> Option<RemoteHub> {
        let entry = self.hubs.get_mut(&hub)?;
        entry.connections.remove(conn);
        if entry.connections.is_empty() {
            return self.hubs.remove(&hub);
        }
        None
    }

    /// Removes every route through `conn`. Returns the hubs that became unreachable.
    pub fn drop_connection(&mut self, conn: ConnectionId) -> Vec<RemoteHub> {
        let mut lost = Vec::new();
        let ids: Vec<HubId> = self.hubs.keys().copied().collect();
        for id in ids {
            if let Some(hub) = self.remove_route(id, conn) {
                lost.push(hub);
            }
        }
        lost.sort_by_key(|h| h.id);
        lost
    }

    pub fn contains(&self, hub: HubId) -> bool {
        self.hubs.contains_key(&hub)
    }

    pub fn get(&self, hub: HubId) -> Option<&RemoteHub> {
        self.hubs.get(&hub)
    }

    pub fn get_mut(&mut self, hub: HubId) -> Option<&mut RemoteHub> {
        self.hubs.get_mut(&hub)
    }

    pub fn route(&self, hub: HubId) -> Option<Route> {
        self.hubs.get(&hub).map(|h| h.connections.snapshot())
    }

    pub fn distance(&self, hub: HubId) -> Option<i32> {
        self.hubs.get(&hub)?.connections.min_distance()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteHub> {
        self.hubs.values()
    }

    pub fn ids(&self) -> Vec<HubId> {
        let mut ids: Vec<HubId> = self.hubs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn info(&self, hub: HubId) -> Option<RemoteHubInfo> {
        let h = self.hubs.get(&hub)?;
        Some(RemoteHubInfo {
            id: h.id,
            name: h.name.clone(),
            distances: h.connections.distances(),
            interfaces: h.interfaces.iter().cloned().collect(),
        })
    }
}
