//! # Interface Handles
//!
//! A resolved reference to one provider of a shared interface. Calls are
//! descriptors whose single parameter is the provider object, bound as `this`.

use meshcall::Descriptor;
use meshcall::FromValue;
use meshcall::Param;
use meshcall::Value;

use crate::error::Result;
use crate::hub::Hub;
use crate::hub::this_param;
use crate::packet::HubId;
use crate::packet::InterfaceLink;

/// Where calls through a handle go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// This hub's own implementation, evaluated in-process.
    Local { id: u32, version: i32 },
    Remote(InterfaceLink),
}

#[derive(Clone)]
pub struct InterfaceHandle {
    hub: Hub,
    name: String,
    target: Target,
}

impl InterfaceHandle {
    pub(crate) fn new(hub: Hub, name: &str, target: Target) -> Self {
        Self { hub, name: name.to_string(), target }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, Target::Local { .. })
    }

    /// The hub that will execute calls.
    pub fn hub_id(&self) -> HubId {
        match self.target {
            Target::Local { .. } => self.hub.id(),
            Target::Remote(link) => link.hub,
        }
    }

    pub fn version(&self) -> i32 {
        match self.target {
            Target::Local { version, .. } => version,
            Target::Remote(link) => link.version,
        }
    }

    /// The parameter descriptors use to refer to the provider object.
    pub fn this(&self) -> Param {
        this_param(&self.name)
    }

    /// Executes `descriptor` against the provider and returns its result.
    pub async fn call(&self, descriptor: &Descriptor) -> Result<Value> {
        match self.target {
            Target::Local { id, .. } => self.hub.call_local(id, descriptor, self.this()).await,
            Target::Remote(link) => self.hub.call_remote(link, descriptor, self.this()).await,
        }
    }

    pub async fn call_as<T: FromValue>(&self, descriptor: &Descriptor) -> Result<T> {
        let value = self.call(descriptor).await?;
        Ok(T::from_value(value)?)
    }
}

impl std::fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceHandle").field("name", &self.name).field("target", &self.target).finish()
    }
}
