//! Scan Context
//!
//! The handle a plugin receives while scanning. All cache mutation goes
//! through a session-local lock so that discovery code may fan out to
//! helper threads that register resources concurrently.

use crate::domain::ports::{RecordId, StoreTransaction};
use crate::error::{Error, Result};
use crate::graph::{Resource, ResourceHandle};
use crate::manager::{LoadedModule, PluginManager};
use crate::plugin::alerts::AlertKey;
use crate::plugin::cache::SessionCache;
use crate::schema::{AttributeValue, ResourceType, StatisticValue};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

struct ScanInner<'a> {
    cache: &'a mut SessionCache,
    tx: &'a mut (dyn StoreTransaction + 'a),
}

/// Plugin-facing API for one scan
pub struct ScanContext<'a> {
    module: &'a LoadedModule,
    manager: &'a PluginManager,
    inner: Mutex<ScanInner<'a>>,
}

impl<'a> ScanContext<'a> {
    pub(crate) fn new(
        module: &'a LoadedModule,
        manager: &'a PluginManager,
        cache: &'a mut SessionCache,
        tx: &'a mut (dyn StoreTransaction + 'a),
    ) -> Self {
        Self {
            module,
            manager,
            inner: Mutex::new(ScanInner { cache, tx }),
        }
    }

    pub fn plugin_name(&self) -> &str {
        self.module.plugin().name()
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    /// Look up one of this module's resource types by class name
    pub fn resource_type(&self, class_name: &str) -> Result<Arc<ResourceType>> {
        self.module.resource_type(class_name).cloned()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Report a resource; returns its handle and whether it was newly created
    pub fn update_or_create<I, K>(
        &self,
        class_name: &str,
        parents: &[ResourceHandle],
        attrs: I,
    ) -> Result<(ResourceHandle, bool)>
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let resource_type = self.resource_type(class_name)?;
        let attrs = collect_attrs(attrs);
        self.inner
            .lock()
            .cache
            .update_or_create(&resource_type, parents, attrs)
    }

    /// Register an instance the plugin constructed itself
    pub fn register(&self, resource: Resource) -> Result<ResourceHandle> {
        self.inner.lock().cache.register(resource)
    }

    /// Find a resource already reported in this session
    pub fn lookup_resource<I, K>(
        &self,
        class_name: &str,
        parents: &[ResourceHandle],
        attrs: I,
    ) -> Result<ResourceHandle>
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let resource_type = self.resource_type(class_name)?;
        let attrs = collect_attrs(attrs);
        self.inner.lock().cache.lookup(&resource_type, parents, attrs)
    }

    /// Parentless resources of this module, persisted or only cached
    ///
    /// Persisted roots that are not cached yet are loaded from the store and
    /// registered in the session so that the plugin can hang children off
    /// them.
    pub fn get_root_resources(&self) -> Result<Vec<ResourceHandle>> {
        let mut inner = self.inner.lock();
        let mut roots = Vec::new();

        for class in self.module.classes() {
            for record_id in inner.tx.records_of_class(class.class_id)? {
                if !inner.tx.parents_of(record_id)?.is_empty() {
                    continue;
                }
                let mut visited = HashSet::new();
                if let Some(handle) = self.materialize(&mut inner, record_id, &mut visited)? {
                    roots.push(handle);
                }
            }
        }

        for handle in inner.cache.unpersisted_roots() {
            if inner.cache.get(handle)?.resource_type().module() == self.module.name() {
                roots.push(handle);
            }
        }
        roots.sort();
        roots.dedup();
        Ok(roots)
    }

    fn materialize(
        &self,
        inner: &mut ScanInner<'a>,
        record_id: RecordId,
        visited: &mut HashSet<RecordId>,
    ) -> Result<Option<ResourceHandle>> {
        if let Some(handle) = inner.cache.handle_for_record(record_id) {
            return Ok(Some(handle));
        }
        if !visited.insert(record_id) {
            return Ok(None);
        }

        let record = inner
            .tx
            .record(record_id)?
            .ok_or(Error::RecordNotFound(record_id))?;
        let class = inner
            .tx
            .class(record.class_id)?
            .ok_or_else(|| Error::store("class", format!("{} has no class", record_id)))?;
        let resource_type = self
            .manager
            .get_resource_class(&class.module, &class.class_name)?;

        let mut parents = Vec::new();
        for parent_id in inner.tx.parents_of(record_id)? {
            if let Some(parent) = self.materialize(inner, parent_id, visited)? {
                parents.push(parent);
            }
        }
        let scope = match record.scope_id {
            Some(scope_id) => self.materialize(inner, scope_id, visited)?,
            None => None,
        };

        let values = inner.tx.attributes_of(record_id)?;
        let handle = inner.cache.insert_materialized(
            resource_type,
            values,
            record_id,
            record.id_str,
            parents,
            scope,
        )?;
        debug!(%record_id, %handle, "Materialized persisted resource");
        Ok(Some(handle))
    }

    // =========================================================================
    // Resource Access
    // =========================================================================

    /// Snapshot of a cached resource
    pub fn resource(&self, handle: ResourceHandle) -> Result<Resource> {
        self.inner.lock().cache.get(handle).cloned()
    }

    pub fn get_attribute(&self, handle: ResourceHandle, name: &str) -> Result<Option<AttributeValue>> {
        Ok(self.inner.lock().cache.get(handle)?.get(name).cloned())
    }

    pub fn set_attribute(
        &self,
        handle: ResourceHandle,
        name: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<bool> {
        self.inner
            .lock()
            .cache
            .set_attribute(handle, name, value.into())
    }

    pub fn unset_attribute(&self, handle: ResourceHandle, name: &str) -> Result<bool> {
        self.inner.lock().cache.unset_attribute(handle, name)
    }

    pub fn add_parent(&self, child: ResourceHandle, parent: ResourceHandle) -> Result<bool> {
        self.inner.lock().cache.add_parent(child, parent)
    }

    /// Detach a parent; the edge is removed from the store at the next flush
    pub fn remove_parent(&self, child: ResourceHandle, parent: ResourceHandle) -> Result<bool> {
        self.inner.lock().cache.remove_parent(child, parent)
    }

    /// Forget a resource; its record is culled at the next flush
    pub fn unregister_resource(&self, handle: ResourceHandle) -> Result<()> {
        self.inner.lock().cache.unregister(handle)
    }

    // =========================================================================
    // Alerts and Statistics
    // =========================================================================

    /// Report the current state of an alert
    ///
    /// Returns whether the reported state changed. A change reaches the
    /// store at the next flush unless it is reverted first.
    pub fn notify_alert(
        &self,
        handle: ResourceHandle,
        condition: &str,
        attribute: Option<&str>,
        active: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.cache.get(handle)?;
        Ok(inner
            .cache
            .alerts_mut()
            .notify(AlertKey::new(handle, condition, attribute), active))
    }

    pub fn update_statistic(
        &self,
        handle: ResourceHandle,
        name: &str,
        value: StatisticValue,
    ) -> Result<()> {
        self.inner.lock().cache.update_statistic(handle, name, value)
    }
}

fn collect_attrs<I, K>(attrs: I) -> BTreeMap<String, AttributeValue>
where
    I: IntoIterator<Item = (K, AttributeValue)>,
    K: Into<String>,
{
    attrs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
