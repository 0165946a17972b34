//! Session Cache
//!
//! Every resource a plugin session has registered, addressed by handle and
//! by identity. The cache is the session's in-memory view of its part of
//! the graph; the flush turns its dirty state into store mutations.

use crate::domain::ports::RecordId;
use crate::error::{Error, Result};
use crate::graph::{find_scope, key_for, IndexKey, Resource, ResourceHandle, ResourceIndex, ScopeSearch};
use crate::plugin::alerts::AlertTracker;
use crate::schema::{AttributeValue, ResourceType, StatisticValue};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Cached resources of one plugin session
#[derive(Debug, Default)]
pub struct SessionCache {
    next_handle: u64,
    resources: HashMap<ResourceHandle, Resource>,
    index: ResourceIndex,
    keys: HashMap<ResourceHandle, IndexKey>,
    by_record: HashMap<RecordId, ResourceHandle>,
    pending_culls: BTreeSet<RecordId>,
    alerts: AlertTracker,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, handle: ResourceHandle) -> Result<&Resource> {
        self.resources.get(&handle).ok_or_else(|| not_registered(handle))
    }

    fn get_mut(&mut self, handle: ResourceHandle) -> Result<&mut Resource> {
        self.resources
            .get_mut(&handle)
            .ok_or_else(|| not_registered(handle))
    }

    /// Handles in registration order
    pub fn handles(&self) -> Vec<ResourceHandle> {
        let mut handles: Vec<_> = self.resources.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn handle_for_record(&self, record_id: RecordId) -> Option<ResourceHandle> {
        self.by_record.get(&record_id).copied()
    }

    /// Scope ancestor a locally identified resource was indexed under
    pub fn scope_of(&self, handle: ResourceHandle) -> Option<ResourceHandle> {
        match self.keys.get(&handle) {
            Some(IndexKey::Local { scope, .. }) => Some(*scope),
            _ => None,
        }
    }

    fn allocate_handle(&mut self) -> ResourceHandle {
        self.next_handle += 1;
        ResourceHandle(self.next_handle)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Resolve a report to a cached resource, creating it on a miss
    ///
    /// On a hit the supplied values overwrite the cached ones and new
    /// parents are attached. Returns the handle and whether it was created.
    pub fn update_or_create(
        &mut self,
        resource_type: &Arc<ResourceType>,
        parents: &[ResourceHandle],
        attrs: BTreeMap<String, AttributeValue>,
    ) -> Result<(ResourceHandle, bool)> {
        let candidate = Resource::new(resource_type.clone(), attrs)?;
        validate_values(&candidate)?;
        self.check_parents(resource_type, parents)?;

        let scope = self.register_scope(resource_type, parents)?;
        let key = key_for(resource_type, candidate.id_str()?, scope)?;

        if let Some(handle) = self.index.get(&key) {
            let resource = self.get_mut(handle)?;
            for (name, value) in candidate.values() {
                resource.set(name.clone(), value.clone())?;
            }
            for parent in parents {
                resource.add_parent(*parent);
            }
            debug!(resource = %resource, "Updated cached resource");
            return Ok((handle, false));
        }

        let mut resource = candidate;
        resource.validate()?;
        for parent in parents {
            resource.add_parent(*parent);
        }
        let handle = self.insert(resource, key)?;
        Ok((handle, true))
    }

    /// Register a resource built by the plugin
    pub fn register(&mut self, resource: Resource) -> Result<ResourceHandle> {
        let resource_type = resource.resource_type().clone();
        if resource.handle().is_some() {
            return Err(Error::DuplicateRegistration {
                resource_type: resource_type.name().to_string(),
                id_str: resource.id_str().unwrap_or_default(),
            });
        }
        resource.validate()?;
        self.check_parents(&resource_type, resource.parents())?;

        let scope = self.register_scope(&resource_type, resource.parents())?;
        let key = key_for(&resource_type, resource.id_str()?, scope)?;
        self.insert(resource, key)
    }

    /// Insert a resource rebuilt from a persisted record
    pub(crate) fn insert_materialized(
        &mut self,
        resource_type: Arc<ResourceType>,
        values: BTreeMap<String, AttributeValue>,
        record_id: RecordId,
        id_str: String,
        parents: Vec<ResourceHandle>,
        scope: Option<ResourceHandle>,
    ) -> Result<ResourceHandle> {
        let key = key_for(&resource_type, id_str, scope)?;
        if let Some(existing) = self.index.get(&key) {
            self.by_record.insert(record_id, existing);
            return Ok(existing);
        }

        let mut resource = Resource::from_record(resource_type, values, record_id);
        resource.set_materialized_parents(parents);
        self.insert(resource, key)
    }

    fn insert(&mut self, mut resource: Resource, key: IndexKey) -> Result<ResourceHandle> {
        let handle = ResourceHandle(self.next_handle + 1);
        self.index.insert(key.clone(), handle)?;
        let allocated = self.allocate_handle();
        debug_assert_eq!(allocated, handle);

        resource.assign_handle(handle);
        if let Some(record_id) = resource.record_id() {
            self.by_record.insert(record_id, handle);
        }
        debug!(resource = %resource, "Registered resource");
        self.keys.insert(handle, key);
        self.resources.insert(handle, resource);
        Ok(handle)
    }

    fn check_parents(&self, resource_type: &ResourceType, parents: &[ResourceHandle]) -> Result<()> {
        match parents.iter().find(|p| !self.resources.contains_key(*p)) {
            Some(parent) => Err(Error::OrderingViolation {
                resource_type: resource_type.name().to_string(),
                reason: format!("parent {} has not been registered", parent),
            }),
            None => Ok(()),
        }
    }

    /// Scope ancestor for registration; a missing one is an ordering bug
    fn register_scope(
        &self,
        resource_type: &ResourceType,
        parents: &[ResourceHandle],
    ) -> Result<Option<ResourceHandle>> {
        let Some(scope_type) = resource_type.identifier()?.scope_type() else {
            return Ok(None);
        };
        match find_scope(resource_type.module(), scope_type, parents, &self.resources) {
            ScopeSearch::Found(scope) => Ok(Some(scope)),
            ScopeSearch::NotReachable => Err(Error::OrderingViolation {
                resource_type: resource_type.name().to_string(),
                reason: format!("no registered {} ancestor among its parents", scope_type),
            }),
            ScopeSearch::Unregistered(parent) => Err(Error::OrderingViolation {
                resource_type: resource_type.name().to_string(),
                reason: format!("ancestor {} has not been registered", parent),
            }),
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find a cached resource by identity without creating it
    pub fn lookup(
        &self,
        resource_type: &Arc<ResourceType>,
        parents: &[ResourceHandle],
        attrs: BTreeMap<String, AttributeValue>,
    ) -> Result<ResourceHandle> {
        let probe = Resource::new(resource_type.clone(), attrs)?;
        let id_str = probe.id_str()?;
        let not_found = || Error::ResourceNotFound {
            resource_type: resource_type.name().to_string(),
            id: id_str.clone(),
        };

        let scope = match resource_type.identifier()?.scope_type() {
            None => None,
            Some(scope_type) => match find_scope(
                resource_type.module(),
                scope_type,
                parents,
                &self.resources,
            ) {
                ScopeSearch::Found(scope) => Some(scope),
                ScopeSearch::NotReachable | ScopeSearch::Unregistered(_) => {
                    return Err(Error::ResourceNotFound {
                        resource_type: resource_type.name().to_string(),
                        id: format!("{} (cannot determine where to look)", id_str),
                    })
                }
            },
        };

        let key = key_for(resource_type, id_str.clone(), scope)?;
        self.index.get(&key).ok_or_else(not_found)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Set one attribute through the schema, reindexing on identity changes
    pub fn set_attribute(
        &mut self,
        handle: ResourceHandle,
        name: &str,
        value: AttributeValue,
    ) -> Result<bool> {
        let resource = self.get_mut(handle)?;
        if let Some(def) = resource.resource_type().attribute(name) {
            def.validate(name, &value)?;
        }
        let previous = resource.get(name).cloned();
        if !resource.set(name, value)? {
            return Ok(false);
        }
        if self.is_identity_field(handle, name)? {
            if let Err(e) = self.rekey(handle) {
                let resource = self.get_mut(handle)?;
                match previous {
                    Some(value) => resource.set(name, value)?,
                    None => resource.unset(name)?,
                };
                return Err(e);
            }
        }
        Ok(true)
    }

    pub fn unset_attribute(&mut self, handle: ResourceHandle, name: &str) -> Result<bool> {
        if self.is_identity_field(handle, name)? {
            let resource = self.get(handle)?;
            return Err(Error::Validation {
                attribute: name.to_string(),
                reason: format!("identifier field of {} cannot be unset", resource.resource_type().name()),
            });
        }
        self.get_mut(handle)?.unset(name)
    }

    fn is_identity_field(&self, handle: ResourceHandle, name: &str) -> Result<bool> {
        let resource = self.get(handle)?;
        Ok(resource
            .resource_type()
            .identifier()?
            .fields()
            .iter()
            .any(|f| f == name))
    }

    fn rekey(&mut self, handle: ResourceHandle) -> Result<()> {
        let resource = self.get(handle)?;
        let scope = self.scope_of(handle);
        let key = key_for(resource.resource_type(), resource.id_str()?, scope)?;
        let old = self.keys.get(&handle).cloned();
        if old.as_ref() == Some(&key) {
            return Ok(());
        }
        if let Some(old) = &old {
            self.index.remove(old);
        }
        if let Err(e) = self.index.insert(key.clone(), handle) {
            if let Some(old) = old {
                self.index.insert(old, handle)?;
            }
            return Err(e);
        }
        self.keys.insert(handle, key);
        Ok(())
    }

    pub fn add_parent(&mut self, child: ResourceHandle, parent: ResourceHandle) -> Result<bool> {
        let child_type = self.get(child)?.resource_type().clone();
        self.check_parents(&child_type, &[parent])?;
        Ok(self.get_mut(child)?.add_parent(parent))
    }

    pub fn remove_parent(&mut self, child: ResourceHandle, parent: ResourceHandle) -> Result<bool> {
        let child_type = self.get(child)?.resource_type().clone();
        self.check_parents(&child_type, &[parent])?;
        Ok(self.get_mut(child)?.remove_parent(parent))
    }

    pub fn update_statistic(
        &mut self,
        handle: ResourceHandle,
        name: &str,
        value: StatisticValue,
    ) -> Result<()> {
        self.get_mut(handle)?.update_statistic(name, value)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Evict a resource and queue its record for culling at the next flush
    ///
    /// Cached children left without parents are unregistered with it.
    pub fn unregister(&mut self, handle: ResourceHandle) -> Result<()> {
        self.get(handle)?;
        let mut visited = HashSet::new();
        self.unregister_recursive(handle, &mut visited);
        Ok(())
    }

    fn unregister_recursive(&mut self, handle: ResourceHandle, visited: &mut HashSet<ResourceHandle>) {
        if !visited.insert(handle) {
            return;
        }
        if let Some(record_id) = self.resources.get(&handle).and_then(Resource::record_id) {
            self.pending_culls.insert(record_id);
        }
        for orphan in self.evict(handle) {
            self.unregister_recursive(orphan, visited);
        }
    }

    /// Drop a resource from the cache
    ///
    /// Returns the non-root children left without any parent.
    pub(crate) fn evict(&mut self, handle: ResourceHandle) -> Vec<ResourceHandle> {
        let Some(resource) = self.resources.remove(&handle) else {
            return Vec::new();
        };
        if let Some(key) = self.keys.remove(&handle) {
            self.index.remove(&key);
        }
        if let Some(record_id) = resource.record_id() {
            self.by_record.remove(&record_id);
        }
        self.alerts.forget_resource(handle);
        debug!(resource = %resource, "Evicted resource");

        let mut orphans = Vec::new();
        for (child_handle, child) in self.resources.iter_mut() {
            if child.parents().contains(&handle) {
                child.forget_parent(handle);
                if child.parents().is_empty() && !child.is_root() {
                    orphans.push(*child_handle);
                }
            }
        }
        orphans.sort();
        orphans
    }

    /// Drop the cached copy of a record culled from the store
    pub(crate) fn evict_record(&mut self, record_id: RecordId) {
        if let Some(handle) = self.handle_for_record(record_id) {
            self.evict(handle);
        }
    }

    pub(crate) fn pending_culls(&self) -> &BTreeSet<RecordId> {
        &self.pending_culls
    }

    pub(crate) fn clear_pending_culls(&mut self) {
        self.pending_culls.clear();
    }

    // =========================================================================
    // Flush Support
    // =========================================================================

    pub(crate) fn resource_mut(&mut self, handle: ResourceHandle) -> Option<&mut Resource> {
        self.resources.get_mut(&handle)
    }

    pub(crate) fn mark_persisted(&mut self, handle: ResourceHandle, record_id: RecordId) {
        if let Some(resource) = self.resources.get_mut(&handle) {
            resource.mark_persisted(record_id);
            self.by_record.insert(record_id, handle);
        }
    }

    pub(crate) fn alerts(&self) -> &AlertTracker {
        &self.alerts
    }

    pub(crate) fn alerts_mut(&mut self) -> &mut AlertTracker {
        &mut self.alerts
    }

    /// Cached resources without parents that have no record yet
    pub fn unpersisted_roots(&self) -> Vec<ResourceHandle> {
        let mut roots: Vec<_> = self
            .resources
            .iter()
            .filter(|(_, r)| r.record_id().is_none() && r.parents().is_empty())
            .map(|(h, _)| *h)
            .collect();
        roots.sort();
        roots
    }
}

fn validate_values(resource: &Resource) -> Result<()> {
    for (name, value) in resource.values() {
        if let Some(def) = resource.resource_type().attribute(name) {
            def.validate(name, value)?;
        }
    }
    Ok(())
}

fn not_registered(handle: ResourceHandle) -> Error {
    Error::ResourceNotFound {
        resource_type: "resource".to_string(),
        id: handle.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;

    fn attrs<const N: usize>(pairs: [(&str, AttributeValue); N]) -> BTreeMap<String, AttributeValue> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn array(cache: &mut SessionCache, serial: &str) -> ResourceHandle {
        cache
            .update_or_create(&testing::array_type(), &[], attrs([("serial", serial.into())]))
            .unwrap()
            .0
    }

    #[test]
    fn test_local_id_same_scope_resolves_to_same_instance() {
        let mut cache = SessionCache::new();
        let disk_type = testing::disk_type();
        let a1 = array(&mut cache, "A1");

        let (d1, created) = cache
            .update_or_create(&disk_type, &[a1], attrs([("slot", 3.into())]))
            .unwrap();
        assert!(created);

        let (again, created) = cache
            .update_or_create(&disk_type, &[a1], attrs([("slot", 3.into())]))
            .unwrap();
        assert_eq!(again, d1);
        assert!(!created);
    }

    #[test]
    fn test_local_id_under_other_scope_is_distinct() {
        let mut cache = SessionCache::new();
        let disk_type = testing::disk_type();
        let a1 = array(&mut cache, "A1");
        let a2 = array(&mut cache, "A2");

        let (d1, _) = cache
            .update_or_create(&disk_type, &[a1], attrs([("slot", 3.into())]))
            .unwrap();
        let (d2, created) = cache
            .update_or_create(&disk_type, &[a2], attrs([("slot", 3.into())]))
            .unwrap();
        assert!(created);
        assert_ne!(d1, d2);
    }

    #[test]
    fn test_global_id_ignores_parents() {
        let mut cache = SessionCache::new();
        let a1 = array(&mut cache, "A1");
        let host_type = testing::host_type();

        let (h1, _) = cache
            .update_or_create(&host_type, &[], attrs([("hostname", "node1".into())]))
            .unwrap();
        let (h2, created) = cache
            .update_or_create(&host_type, &[a1], attrs([("hostname", "node1".into())]))
            .unwrap();
        assert_eq!(h1, h2);
        assert!(!created);
        assert_eq!(cache.get(h1).unwrap().parents(), &[a1]);
    }

    #[test]
    fn test_unregistered_scope_is_ordering_violation() {
        let mut cache = SessionCache::new();
        let result = cache.update_or_create(
            &testing::disk_type(),
            &[ResourceHandle(42)],
            attrs([("slot", 3.into())]),
        );
        assert_matches!(result, Err(Error::OrderingViolation { .. }));

        let unscoped = cache.update_or_create(&testing::disk_type(), &[], attrs([("slot", 3.into())]));
        assert_matches!(unscoped, Err(Error::OrderingViolation { .. }));
    }

    #[test]
    fn test_register_twice_is_duplicate() {
        let mut cache = SessionCache::new();
        let a1 = array(&mut cache, "A1");

        let registered = cache.get(a1).unwrap().clone();
        assert_matches!(
            cache.register(registered),
            Err(Error::DuplicateRegistration { .. })
        );

        let twin = Resource::new(testing::array_type(), [("serial", "A1".into())]).unwrap();
        assert_matches!(cache.register(twin), Err(Error::DuplicateRegistration { .. }));
    }

    #[test]
    fn test_update_validates_values() {
        let mut cache = SessionCache::new();
        let a1 = array(&mut cache, "A1");
        let result = cache.update_or_create(&testing::disk_type(), &[a1], attrs([("slot", 99.into())]));
        assert_matches!(result, Err(Error::Validation { attribute, .. }) if attribute == "slot");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lookup_paths() {
        let mut cache = SessionCache::new();
        let disk_type = testing::disk_type();
        let a1 = array(&mut cache, "A1");
        let (d1, _) = cache
            .update_or_create(&disk_type, &[a1], attrs([("slot", 3.into())]))
            .unwrap();

        assert_eq!(cache.lookup(&disk_type, &[a1], attrs([("slot", 3.into())])).unwrap(), d1);
        assert_matches!(
            cache.lookup(&disk_type, &[a1], attrs([("slot", 4.into())])),
            Err(Error::ResourceNotFound { .. })
        );
        assert_matches!(
            cache.lookup(&disk_type, &[], attrs([("slot", 3.into())])),
            Err(Error::ResourceNotFound { id, .. }) if id.contains("cannot determine")
        );
    }

    #[test]
    fn test_new_instance_requires_mandatory_attributes() {
        let mut cache = SessionCache::new();
        let pool_type = ResourceType::builder(testing::ARRAY_MODULE, "Pool")
            .identifier(crate::schema::Identifier::global(["name"]))
            .attribute("name", crate::schema::AttributeDef::string())
            .attribute("size", crate::schema::AttributeDef::bytes())
            .build()
            .unwrap();

        assert_matches!(
            cache.update_or_create(&pool_type, &[], attrs([("name", "p1".into())])),
            Err(Error::MissingMandatoryAttribute { attribute, .. }) if attribute == "size"
        );
        assert!(cache.is_empty());

        let bare = Resource::new(pool_type.clone(), [("name", "p1".into())]).unwrap();
        assert_matches!(
            cache.register(bare),
            Err(Error::MissingMandatoryAttribute { .. })
        );

        let (pool, created) = cache
            .update_or_create(
                &pool_type,
                &[],
                attrs([("name", "p1".into()), ("size", 1024.into())]),
            )
            .unwrap();
        assert!(created);

        let (again, created) = cache
            .update_or_create(&pool_type, &[], attrs([("name", "p1".into())]))
            .unwrap();
        assert_eq!(again, pool);
        assert!(!created);
        assert_eq!(cache.get(pool).unwrap().get("size"), Some(&1024.into()));
    }

    #[test]
    fn test_lookup_passes_over_unregistered_parent() {
        let mut cache = SessionCache::new();
        let disk_type = testing::disk_type();
        let a1 = array(&mut cache, "A1");
        let (d1, _) = cache
            .update_or_create(&disk_type, &[a1], attrs([("slot", 3.into())]))
            .unwrap();

        assert_eq!(
            cache
                .lookup(&disk_type, &[ResourceHandle(42), a1], attrs([("slot", 3.into())]))
                .unwrap(),
            d1
        );
    }

    #[test]
    fn test_identity_change_reindexes() {
        let mut cache = SessionCache::new();
        let array_type = testing::array_type();
        let a1 = array(&mut cache, "A1");
        array(&mut cache, "A2");

        assert!(cache.set_attribute(a1, "serial", "A3".into()).unwrap());
        assert_eq!(
            cache.lookup(&array_type, &[], attrs([("serial", "A3".into())])).unwrap(),
            a1
        );

        assert_matches!(
            cache.set_attribute(a1, "serial", "A2".into()),
            Err(Error::DuplicateRegistration { .. })
        );
        assert_eq!(cache.get(a1).unwrap().get("serial"), Some(&"A3".into()));
    }

    #[test]
    fn test_unregister_evicts_orphaned_children() {
        let mut cache = SessionCache::new();
        let disk_type = testing::disk_type();
        let a1 = array(&mut cache, "A1");
        let (d1, _) = cache
            .update_or_create(&disk_type, &[a1], attrs([("slot", 3.into())]))
            .unwrap();
        cache.mark_persisted(a1, RecordId(10));
        cache.mark_persisted(d1, RecordId(11));

        cache.unregister(a1).unwrap();
        assert!(cache.is_empty());
        assert_eq!(
            cache.pending_culls().iter().copied().collect::<Vec<_>>(),
            vec![RecordId(10), RecordId(11)]
        );
        assert_eq!(cache.handle_for_record(RecordId(10)), None);
    }

    #[test]
    fn test_unpersisted_roots() {
        let mut cache = SessionCache::new();
        let a1 = array(&mut cache, "A1");
        let a2 = array(&mut cache, "A2");
        cache.mark_persisted(a2, RecordId(5));
        assert_eq!(cache.unpersisted_roots(), vec![a1]);
    }
}
