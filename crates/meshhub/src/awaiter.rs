//! # Awaiters
//!
//! Caller-side correlation of outstanding requests with their replies.
//!
//! ## Invariants
//!
//! - Each await id is resolved at most once. A reply for an id nobody waits on
//!   is reported to the caller of `complete` and otherwise dropped.
//! - The `Awaiter` returned by `register` is the only handle on a pending entry.
//!   Dropping it removes the entry, so abandoned calls never accumulate.
//! - Every entry remembers the hub it targets; `fail_hub` resolves all of them
//!   the moment that hub leaves the mesh.

use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;
use crate::packet::HubId;

/// What a reply carried.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Any-encoded result value, decoded by the caller with its own registry.
    Value(Vec<u8>),
    Exception(String),
    StreamInfo { length: i64, position: i64, flags: u8 },
    StreamData(Vec<u8>),
    StreamAck(i64),
}

struct Pending {
    hub: HubId,
    tx: oneshot::Sender<Result<Completion>>,
}

pub struct Awaiters {
    next: AtomicI32,
    pending: DashMap<i32, Pending>,
}

impl Default for Awaiters {
    fn default() -> Self {
        Self { next: AtomicI32::new(1), pending: DashMap::new() }
    }
}

impl Awaiters {
    /// Allocates a fresh await id bound to `hub`.
    pub fn register(self: &Arc<Self>, hub: HubId) -> Awaiter {
        let id = loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.pending.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { hub, tx });
        Awaiter { id, hub, rx: Some(rx), owner: self.clone() }
    }

    /// Resolves `id`. Returns false if nobody was waiting.
    pub fn complete(&self, id: i32, result: Result<Completion>) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => pending.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fails every request addressed to `hub`.
    pub fn fail_hub(&self, hub: HubId) -> usize {
        let ids: Vec<i32> = self
            .pending
            .iter()
            .filter(|e| e.value().hub == hub)
            .map(|e| *e.key())
            .collect();
        let mut failed = 0;
        for id in ids {
            if self.complete(id, Err(Error::HubUnavailable(hub))) {
                failed += 1;
            }
        }
        failed
    }

    pub fn fail_all(&self, error: Error) {
        let ids: Vec<i32> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.complete(id, Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One outstanding request.
pub struct Awaiter {
    id: i32,
    hub: HubId,
    rx: Option<oneshot::Receiver<Result<Completion>>>,
    owner: Arc<Awaiters>,
}

impl Awaiter {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn hub(&self) -> HubId {
        self.hub
    }

    /// Waits for the reply for at most `deadline`.
    pub async fn wait(mut self, deadline: Duration) -> Result<Completion> {
        let Some(rx) = self.rx.take() else { return Err(Error::Closed) };
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout("call result")),
        }
    }
}

impl Drop for Awaiter {
    fn drop(&mut self) {
        self.owner.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let awaiters = Arc::new(Awaiters::default());
        let a = awaiters.register(7);
        let id = a.id();
        assert!(awaiters.complete(id, Ok(Completion::StreamAck(3))));
        assert!(!awaiters.complete(id, Ok(Completion::StreamAck(4))));
        assert_eq!(a.wait(Duration::from_secs(1)).await, Ok(Completion::StreamAck(3)));
        assert!(awaiters.is_empty());
    }

    #[tokio::test]
    async fn test_fail_hub_only_touches_that_hub() {
        let awaiters = Arc::new(Awaiters::default());
        let a = awaiters.register(1);
        let b = awaiters.register(2);
        assert_eq!(awaiters.fail_hub(1), 1);
        assert_eq!(a.wait(Duration::from_secs(1)).await, Err(Error::HubUnavailable(1)));
        assert_eq!(awaiters.len(), 1);
        drop(b);
        assert!(awaiters.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_and_drop_clean_up() {
        let awaiters = Arc::new(Awaiters::default());
        let a = awaiters.register(1);
        assert_eq!(a.wait(Duration::from_millis(10)).await, Err(Error::Timeout("call result")));
        assert!(awaiters.is_empty());

        let fut = awaiters.register(1).wait(Duration::from_secs(60));
        drop(fut);
        assert!(awaiters.is_empty());
    }
}
