//! # Hub Configuration
//!
//! Plain settings plus a fluent builder.

use std::sync::Arc;
use std::time::Duration;

use meshcall::Catalog;
use meshcall::TypeRegistry;

use crate::hub::Hub;
use crate::packet::HubId;

#[derive(Clone)]
pub struct HubConfig {
    pub id: HubId,
    pub name: String,
    /// Forward topology, interface announcements and retransmitted calls for others.
    pub relay: bool,
    pub handshake_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// Bound on the blocking fallback when every route is leased.
    pub acquire_timeout: Duration,
    /// Deadline for one outstanding call or stream operation.
    pub call_timeout: Duration,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<TypeRegistry>,
}

/// A random non-zero id.
pub fn random_hub_id() -> HubId {
    loop {
        let id: HubId = rand::random();
        if id != 0 {
            return id;
        }
    }
}

impl HubConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: random_hub_id(),
            name: name.into(),
            relay: false,
            handshake_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            catalog: Arc::new(Catalog::with_builtins()),
            registry: Arc::new(TypeRegistry::new()),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::new("hub")
    }
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("relay", &self.relay)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("disconnect_timeout", &self.disconnect_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

/// Re-dial behavior for an actively opened TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), max_attempts: 5 }
    }
}

/// Fluent builder for a `Hub`.
pub struct HubBuilder {
    config: HubConfig,
}

impl HubBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { config: HubConfig::new(name) }
    }

    pub fn id(mut self, id: HubId) -> Self {
        self.config.id = id;
        self
    }

    pub fn relay(mut self, relay: bool) -> Self {
        self.config.relay = relay;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.disconnect_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.config.catalog = Arc::new(catalog);
        self
    }

    /// Shares one catalog between several hubs.
    pub fn shared_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.config.catalog = catalog;
        self
    }

    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.config.registry = Arc::new(registry);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn build(self) -> Hub {
        Hub::new(self.config)
    }
}
