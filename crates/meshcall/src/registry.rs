//! # Type Registry
//!
//! Bidirectional mapping between external type names and the compact `u32`
//! ids used by `Registered` type tags.
//!
//! ## Invariants
//! - A name or id, once added to a scope, never changes within that scope.
//! - Lookups fall back to the parent chain; writes always stay local.
//! - Ids allocated by a child never shadow an id visible through its parent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::Catalog;
use crate::error::Error;
use crate::error::Result;
use crate::types::TypeName;

#[derive(Default)]
struct Scope {
    by_id: HashMap<u32, TypeName>,
    by_name: HashMap<TypeName, u32>,
    /// Names resolved through the catalog for `Unregistered` tags.
    resolved: HashMap<String, TypeName>,
    next_id: u32,
}

/// A scoped id <-> type table, optionally chained to a parent scope.
#[derive(Default)]
pub struct TypeRegistry {
    parent: Option<Arc<TypeRegistry>>,
    scope: RwLock<Scope>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new scope that starts from this one but diverges on write.
    pub fn child(self: &Arc<Self>) -> TypeRegistry {
        TypeRegistry { parent: Some(self.clone()), scope: RwLock::new(Scope::default()) }
    }

    /// Registers `name` under the next free id. Returns the existing id if
    /// the name is already visible.
    pub fn register(&self, name: &str) -> u32 {
        if let Some(id) = self.id_of(name) {
            return id;
        }
        let mut scope = self.scope.write();
        if let Some(&id) = scope.by_name.get(name) {
            return id;
        }
        let mut id = scope.next_id;
        while scope.by_id.contains_key(&id) || self.parent_name_of(id).is_some() {
            id += 1;
        }
        scope.next_id = id + 1;
        let name: TypeName = Arc::from(name);
        scope.by_id.insert(id, name.clone());
        scope.by_name.insert(name, id);
        id
    }

    /// Registers `name` under a specific id. Re-registering the identical
    /// pair is a no-op; any other overlap is rejected.
    pub fn register_with_id(&self, name: &str, id: u32) -> Result<()> {
        let existing_name = self.name_of(id);
        let existing_id = self.id_of(name);
        match (existing_name, existing_id) {
            (Some(n), Some(i)) if &*n == name && i == id => return Ok(()),
            (None, None) => {}
            (Some(n), _) => {
                return Err(Error::Resolution(format!("type id {} already bound to {}", id, n)));
            }
            (None, Some(i)) => {
                return Err(Error::Resolution(format!("type {} already bound to id {}", name, i)));
            }
        }
        let mut scope = self.scope.write();
        let name: TypeName = Arc::from(name);
        scope.by_id.insert(id, name.clone());
        scope.by_name.insert(name, id);
        if scope.next_id <= id {
            scope.next_id = id.saturating_add(1);
        }
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        if let Some(&id) = self.scope.read().by_name.get(name) {
            return Some(id);
        }
        self.parent.as_ref().and_then(|p| p.id_of(name))
    }

    pub fn name_of(&self, id: u32) -> Option<TypeName> {
        if let Some(name) = self.scope.read().by_id.get(&id) {
            return Some(name.clone());
        }
        self.parent_name_of(id)
    }

    fn parent_name_of(&self, id: u32) -> Option<TypeName> {
        self.parent.as_ref().and_then(|p| p.name_of(id))
    }

    /// Resolves the name carried by an `Unregistered` type tag. Only types the
    /// catalog knows are accepted; the answer is cached per scope.
    pub fn resolve_unregistered(&self, name: &str, catalog: &Catalog) -> Result<TypeName> {
        if let Some(hit) = self.scope.read().resolved.get(name) {
            return Ok(hit.clone());
        }
        let resolved = catalog
            .lookup_name(name)
            .ok_or_else(|| Error::Resolution(format!("unknown type name {}", name)))?;
        self.scope.write().resolved.insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Number of ids bound in this scope, excluding the parent chain.
    pub fn local_len(&self) -> usize {
        self.scope.read().by_id.len()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("local", &self.local_len())
            .field("chained", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_reads_parent_writes_local() {
        let base = Arc::new(TypeRegistry::new());
        let a = base.register("demo.A");
        let child = base.child();
        assert_eq!(child.id_of("demo.A"), Some(a));

        let b = child.register("demo.B");
        assert_ne!(a, b);
        assert_eq!(base.id_of("demo.B"), None);
        assert_eq!(child.name_of(b).as_deref(), Some("demo.B"));
    }

    #[test]
    fn test_register_with_id_conflicts() {
        let reg = TypeRegistry::new();
        reg.register_with_id("demo.A", 7).unwrap();
        reg.register_with_id("demo.A", 7).unwrap();
        assert!(matches!(reg.register_with_id("demo.B", 7), Err(Error::Resolution(_))));
        assert!(matches!(reg.register_with_id("demo.A", 8), Err(Error::Resolution(_))));
        assert_eq!(reg.register("demo.C"), 8);
    }
}
