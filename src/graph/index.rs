//! Resource Index
//!
//! Per-session lookup of cached resources by identity. Global identities are
//! keyed by (type, id string); local identities additionally by the handle
//! of the scope ancestor.

use crate::error::{Error, Result};
use crate::graph::resource::{Resource, ResourceHandle};
use crate::schema::{Identifier, ResourceType};
use std::collections::{HashMap, HashSet};

/// Identity of a cached resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Global {
        resource_type: String,
        id_str: String,
    },
    Local {
        resource_type: String,
        scope: ResourceHandle,
        id_str: String,
    },
}

/// Identity index over a session's cache
#[derive(Debug, Default)]
pub struct ResourceIndex {
    by_key: HashMap<IndexKey, ResourceHandle>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity; a second resource with the same identity is a plugin bug
    pub fn insert(&mut self, key: IndexKey, handle: ResourceHandle) -> Result<()> {
        if self.by_key.contains_key(&key) {
            let (resource_type, id_str) = match &key {
                IndexKey::Global {
                    resource_type,
                    id_str,
                }
                | IndexKey::Local {
                    resource_type,
                    id_str,
                    ..
                } => (resource_type.clone(), id_str.clone()),
            };
            return Err(Error::DuplicateRegistration {
                resource_type,
                id_str,
            });
        }
        self.by_key.insert(key, handle);
        Ok(())
    }

    pub fn get(&self, key: &IndexKey) -> Option<ResourceHandle> {
        self.by_key.get(key).copied()
    }

    pub fn remove(&mut self, key: &IndexKey) -> Option<ResourceHandle> {
        self.by_key.remove(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Outcome of looking for a scope ancestor among candidate parents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSearch {
    Found(ResourceHandle),
    /// No ancestor of the scope type is reachable from the candidates
    NotReachable,
    /// Nothing was found and this candidate handle is not registered in
    /// this session
    Unregistered(ResourceHandle),
}

/// Depth-first search through `parents` and their ancestors for the nearest
/// resource whose type is, or derives from, `scope_type` as seen from
/// `module`
///
/// Unregistered handles are passed over; the first one met is reported only
/// when no scope ancestor is found.
pub fn find_scope(
    module: &str,
    scope_type: &str,
    parents: &[ResourceHandle],
    resources: &HashMap<ResourceHandle, Resource>,
) -> ScopeSearch {
    let mut visited = HashSet::new();
    let mut unregistered = None;
    let mut stack: Vec<ResourceHandle> = parents.iter().rev().copied().collect();

    while let Some(handle) = stack.pop() {
        if !visited.insert(handle) {
            continue;
        }
        let Some(resource) = resources.get(&handle) else {
            unregistered.get_or_insert(handle);
            continue;
        };
        if resource.resource_type().is_a_in(module, scope_type) {
            return ScopeSearch::Found(handle);
        }
        stack.extend(resource.parents().iter().rev().copied());
    }
    match unregistered {
        Some(handle) => ScopeSearch::Unregistered(handle),
        None => ScopeSearch::NotReachable,
    }
}

/// Compute the identity key for a resource of `resource_type` whose identity
/// fields serialize to `id_str`, under the given scope ancestor
pub fn key_for(
    resource_type: &ResourceType,
    id_str: String,
    scope: Option<ResourceHandle>,
) -> Result<IndexKey> {
    match (resource_type.identifier()?, scope) {
        (Identifier::Global { .. }, _) => Ok(IndexKey::Global {
            resource_type: resource_type.name().to_string(),
            id_str,
        }),
        (Identifier::Local { .. }, Some(scope)) => Ok(IndexKey::Local {
            resource_type: resource_type.name().to_string(),
            scope,
            id_str,
        }),
        (Identifier::Local { scope, .. }, None) => Err(Error::Internal(format!(
            "local identity of {} requires a {} scope",
            resource_type.name(),
            scope
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;

    fn registered(resource: Resource, handle: u64, parents: &[u64]) -> (ResourceHandle, Resource) {
        let mut resource = resource;
        for p in parents {
            resource.add_parent(ResourceHandle(*p));
        }
        resource.assign_handle(ResourceHandle(handle));
        (ResourceHandle(handle), resource)
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut index = ResourceIndex::new();
        let key = IndexKey::Global {
            resource_type: "Array".into(),
            id_str: r#"["A1"]"#.into(),
        };
        index.insert(key.clone(), ResourceHandle(1)).unwrap();
        assert_matches!(
            index.insert(key.clone(), ResourceHandle(2)),
            Err(Error::DuplicateRegistration { .. })
        );
        assert_eq!(index.get(&key), Some(ResourceHandle(1)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_find_scope_walks_ancestors() {
        let mut resources = HashMap::new();
        let array = Resource::new(testing::array_type(), [("serial", "A1".into())]).unwrap();
        let shelf = Resource::new(testing::shelf_type(), [("index", 0.into())]).unwrap();
        let (h1, r1) = registered(array, 1, &[]);
        let (h2, r2) = registered(shelf, 2, &[1]);
        resources.insert(h1, r1);
        resources.insert(h2, r2);

        assert_eq!(find_scope("array", "Array", &[h2], &resources), ScopeSearch::Found(h1));
        assert_eq!(find_scope("array", "Host", &[h2], &resources), ScopeSearch::NotReachable);
        assert_eq!(
            find_scope("array", "Array", &[ResourceHandle(9)], &resources),
            ScopeSearch::Unregistered(ResourceHandle(9))
        );
    }

    #[test]
    fn test_find_scope_passes_over_unregistered_candidates() {
        let mut resources = HashMap::new();
        let array = Resource::new(testing::array_type(), [("serial", "A1".into())]).unwrap();
        let (h1, r1) = registered(array, 1, &[]);
        resources.insert(h1, r1);

        assert_eq!(
            find_scope("array", "Array", &[ResourceHandle(9), h1], &resources),
            ScopeSearch::Found(h1)
        );
        assert_eq!(
            find_scope("array", "Shelf", &[ResourceHandle(9), h1], &resources),
            ScopeSearch::Unregistered(ResourceHandle(9))
        );
    }

    #[test]
    fn test_find_scope_ignores_same_name_in_other_module() {
        let mut resources = HashMap::new();
        let foreign = ResourceType::builder("vendor", "Array")
            .attribute("serial", crate::schema::AttributeDef::string())
            .identifier(Identifier::global(["serial"]))
            .build()
            .unwrap();
        let array = Resource::new(foreign, [("serial", "V1".into())]).unwrap();
        let (h1, r1) = registered(array, 1, &[]);
        resources.insert(h1, r1);

        assert_eq!(find_scope("array", "Array", &[h1], &resources), ScopeSearch::NotReachable);
        assert_eq!(find_scope("vendor", "Array", &[h1], &resources), ScopeSearch::Found(h1));
    }

    #[test]
    fn test_find_scope_survives_cycles() {
        let mut resources = HashMap::new();
        let a = Resource::new(testing::shelf_type(), [("index", 0.into())]).unwrap();
        let b = Resource::new(testing::shelf_type(), [("index", 1.into())]).unwrap();
        let (h1, r1) = registered(a, 1, &[2]);
        let (h2, r2) = registered(b, 2, &[1]);
        resources.insert(h1, r1);
        resources.insert(h2, r2);

        assert_eq!(find_scope("array", "Array", &[h1], &resources), ScopeSearch::NotReachable);
    }
}
