//! # Shared Interfaces
//!
//! The hub's directory of named capability contracts: at most one local
//! implementation per name, plus every remote provider link learned from the mesh.

use std::collections::BTreeMap;
use std::collections::HashMap;

use meshcall::Value;

use crate::error::Error;
use crate::error::Result;
use crate::packet::HubId;
use crate::packet::InterfaceLink;

pub struct LocalImpl {
    pub id: u32,
    pub version: i32,
    pub target: Value,
}

pub struct SharedInterface {
    pub name: String,
    pub local: Option<LocalImpl>,
    pub links: Vec<InterfaceLink>,
}

impl SharedInterface {
    /// The local implementation as a link (if any) followed by every remote link.
    pub fn entries(&self, own: HubId) -> Vec<InterfaceLink> {
        let mut entries = Vec::with_capacity(self.links.len() + 1);
        if let Some(local) = &self.local {
            entries.push(InterfaceLink { hub: own, id: local.id, version: local.version });
        }
        entries.extend(self.links.iter().copied());
        entries
    }
}

/// Point-in-time view of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    /// `(id, version)` of the local implementation.
    pub local: Option<(u32, i32)>,
    pub links: Vec<InterfaceLink>,
}

pub struct Interfaces {
    by_name: BTreeMap<String, SharedInterface>,
    by_id: HashMap<u32, String>,
    next_id: u32,
}

impl Default for Interfaces {
    fn default() -> Self {
        Self { by_name: BTreeMap::new(), by_id: HashMap::new(), next_id: 1 }
    }
}

impl Interfaces {
    fn entry(&mut self, name: &str) -> &mut SharedInterface {
        self.by_name.entry(name.to_string()).or_insert_with(|| SharedInterface {
            name: name.to_string(),
            local: None,
            links: Vec::new(),
        })
    }

    /// Installs the local implementation and assigns its id.
    pub fn register_local(&mut self, name: &str, version: i32, target: Value) -> Result<u32> {
        if self.by_name.get(name).is_some_and(|i| i.local.is_some()) {
            return Err(Error::Protocol(format!("interface {} already has a local implementation", name)));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entry(name).local = Some(LocalImpl { id, version, target });
        self.by_id.insert(id, name.to_string());
        Ok(id)
    }

    pub fn unregister_local(&mut self, name: &str) -> Option<u32> {
        let iface = self.by_name.get_mut(name)?;
        let local = iface.local.take()?;
        self.by_id.remove(&local.id);
        if iface.links.is_empty() {
            self.by_name.remove(name);
        }
        Some(local.id)
    }

    /// The local implementation registered under `id`.
    pub fn local(&self, id: u32) -> Option<(&str, &LocalImpl)> {
        let name = self.by_id.get(&id)?;
        let local = self.by_name.get(name)?.local.as_ref()?;
        Some((name, local))
    }

    /// Adds the links not already known. Returns exactly those.
    pub fn merge(&mut self, name: &str, links: &[InterfaceLink]) -> Vec<InterfaceLink> {
        let iface = self.entry(name);
        let mut fresh = Vec::new();
        for link in links {
            if !iface.links.contains(link) && !fresh.contains(link) {
                fresh.push(*link);
            }
        }
        iface.links.extend(fresh.iter().copied());
        if iface.local.is_none() && iface.links.is_empty() {
            self.by_name.remove(name);
        }
        fresh
    }

    /// Removes every link from `hub` for `name`.
    pub fn remove_link(&mut self, name: &str, hub: HubId) -> bool {
        let Some(iface) = self.by_name.get_mut(name) else { return false };
        let before = iface.links.len();
        iface.links.retain(|l| l.hub != hub);
        let removed = iface.links.len() != before;
        if iface.local.is_none() && iface.links.is_empty() {
            self.by_name.remove(name);
        }
        removed
    }

    /// Removes every link from `hub`. Returns the affected interface names.
    pub fn drop_hub(&mut self, hub: HubId) -> Vec<String> {
        let names: Vec<String> = self
            .by_name
            .values()
            .filter(|i| i.links.iter().any(|l| l.hub == hub))
            .map(|i| i.name.clone())
            .collect();
        for name in &names {
            self.remove_link(name, hub);
        }
        names
    }

    pub fn get(&self, name: &str) -> Option<&SharedInterface> {
        self.by_name.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedInterface> {
        self.by_name.values()
    }

    pub fn infos(&self) -> Vec<InterfaceInfo> {
        self.by_name
            .values()
            .map(|i| InterfaceInfo {
                name: i.name.clone(),
                local: i.local.as_ref().map(|l| (l.id, l.version)),
                links: i.links.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(hub: HubId, id: u32, version: i32) -> InterfaceLink {
        InterfaceLink { hub, id, version }
    }

    #[test]
    fn test_local_ids_are_sequential_and_unique_per_name() {
        let mut ifaces = Interfaces::default();
        assert_eq!(ifaces.register_local("calc", 1, Value::Null).unwrap(), 1);
        assert_eq!(ifaces.register_local("echo", 1, Value::Null).unwrap(), 2);
        assert!(ifaces.register_local("calc", 2, Value::Null).is_err());

        assert_eq!(ifaces.local(2).map(|(n, _)| n), Some("echo"));
        assert_eq!(ifaces.unregister_local("echo"), Some(2));
        assert!(ifaces.local(2).is_none());
        assert_eq!(ifaces.register_local("echo", 1, Value::Null).unwrap(), 3);
    }

    #[test]
    fn test_merge_returns_only_new_links() {
        let mut ifaces = Interfaces::default();
        assert_eq!(ifaces.merge("calc", &[link(7, 1, 1), link(8, 4, 2)]).len(), 2);
        assert_eq!(ifaces.merge("calc", &[link(7, 1, 1), link(9, 1, 1)]), vec![link(9, 1, 1)]);
        assert!(ifaces.merge("calc", &[link(7, 1, 1)]).is_empty());

        assert_eq!(ifaces.drop_hub(7), vec!["calc".to_string()]);
        assert!(ifaces.remove_link("calc", 8));
        assert!(ifaces.remove_link("calc", 9));
        assert!(ifaces.get("calc").is_none());
    }

    #[test]
    fn test_entries_lead_with_local() {
        let mut ifaces = Interfaces::default();
        ifaces.merge("calc", &[link(3, 9, 1)]);
        let id = ifaces.register_local("calc", 2, Value::Null).unwrap();
        let entries = ifaces.get("calc").unwrap().entries(42);
        assert_eq!(entries, vec![link(42, id, 2), link(3, 9, 1)]);
    }
}
