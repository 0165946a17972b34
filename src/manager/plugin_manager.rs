//! Plugin Manager
//!
//! Loads plugin modules, registers their schemas with the store and keeps
//! the registry of running sessions. One manager is created at process
//! start and shared by reference with the scheduler.

use crate::domain::ports::{ClassId, RecordId, ResourceStoreRef};
use crate::error::{Error, Result};
use crate::graph::Resource;
use crate::manager::catalog::{LoadedModule, LoadedResourceClass, PluginModule};
use crate::metrics::EngineMetrics;
use crate::plugin::{PluginSession, SessionEvent};
use crate::schema::{AttributeValue, ResourceType};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Registry entry of a running session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub module: String,
    pub started_at: DateTime<Utc>,
}

/// Loader and session registry for plugin modules
pub struct PluginManager {
    store: ResourceStoreRef,
    catalog: RwLock<HashMap<String, PluginModule>>,
    loaded: DashMap<String, Arc<LoadedModule>>,
    load_lock: Mutex<()>,
    sessions: DashMap<String, SessionInfo>,
    next_session_id: AtomicU64,
    event_tx: broadcast::Sender<SessionEvent>,
    metrics: Arc<EngineMetrics>,
}

impl PluginManager {
    pub fn new(store: ResourceStoreRef) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            catalog: RwLock::new(HashMap::new()),
            loaded: DashMap::new(),
            load_lock: Mutex::new(()),
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            event_tx,
            metrics: Arc::new(EngineMetrics::new()),
        })
    }

    pub fn store(&self) -> &ResourceStoreRef {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    // =========================================================================
    // Modules
    // =========================================================================

    /// Make a module available for loading, replacing any unloaded one of the same name
    pub fn provide_module(&self, module: PluginModule) {
        debug!(module = %module.name(), "Module provided");
        self.catalog.write().insert(module.name().to_string(), module);
    }

    /// Load a module by name and register its schema with the store
    ///
    /// Later calls return the cached result.
    pub fn load_plugin(&self, name: &str) -> Result<Arc<LoadedModule>> {
        if let Some(loaded) = self.loaded.get(name) {
            return Ok(loaded.value().clone());
        }

        let _guard = self.load_lock.lock();
        if let Some(loaded) = self.loaded.get(name) {
            return Ok(loaded.value().clone());
        }

        let module = self
            .catalog
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Module {
                module: name.to_string(),
                reason: "module has not been provided".into(),
            })?;
        let plugin = module.single_plugin()?.clone();

        let mut tx = self.store.begin()?;
        let mut classes = IndexMap::new();
        for resource_type in module.resource_types() {
            check_loadable(&module, resource_type)?;
            let class_id = tx.get_or_create_class(module.name(), resource_type.name())?;
            for statistic in resource_type.statistics().keys() {
                tx.register_statistic(class_id, statistic)?;
            }
            if classes
                .insert(
                    resource_type.name().to_string(),
                    LoadedResourceClass {
                        resource_type: resource_type.clone(),
                        class_id,
                    },
                )
                .is_some()
            {
                return Err(Error::Module {
                    module: module.name().to_string(),
                    reason: format!("resource type {} declared twice", resource_type.name()),
                });
            }
        }
        tx.commit()?;

        let loaded = Arc::new(LoadedModule::new(module.name().to_string(), plugin, classes));
        info!(
            module = %name,
            plugin = %loaded.plugin().name(),
            classes = loaded.classes().count(),
            "Loaded plugin module"
        );
        self.loaded.insert(name.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn loaded_modules(&self) -> Vec<Arc<LoadedModule>> {
        let mut modules: Vec<_> = self.loaded.iter().map(|e| e.value().clone()).collect();
        modules.sort_by(|a, b| a.name().cmp(b.name()));
        modules
    }

    /// Resource type of a loaded module
    pub fn get_resource_class(&self, module: &str, class_name: &str) -> Result<Arc<ResourceType>> {
        self.loaded_module(module)?.resource_type(class_name).cloned()
    }

    /// Persisted class id of a loaded module's resource type
    pub fn get_resource_class_id(&self, module: &str, class_name: &str) -> Result<ClassId> {
        self.loaded_module(module)?.class_id(class_name)
    }

    fn loaded_module(&self, module: &str) -> Result<Arc<LoadedModule>> {
        self.loaded
            .get(module)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::Module {
                module: module.to_string(),
                reason: "module is not loaded".into(),
            })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Load a module if needed and start a session of its plugin type
    pub fn create_session(self: &Arc<Self>, module: &str) -> Result<PluginSession> {
        let loaded = self.load_plugin(module)?;
        let plugin = loaded.plugin().name().to_string();
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        match self.sessions.entry(plugin.clone()) {
            Entry::Occupied(_) => return Err(Error::SessionAlreadyActive { plugin }),
            Entry::Vacant(entry) => {
                entry.insert(SessionInfo {
                    session_id,
                    module: module.to_string(),
                    started_at: Utc::now(),
                });
            }
        }

        self.metrics.record_session_started();
        info!(%plugin, session_id, "Session registered");
        self.emit(SessionEvent::SessionRegistered {
            plugin: plugin.clone(),
        });
        Ok(PluginSession::new(self.clone(), loaded, session_id))
    }

    pub(crate) fn unregister_session(&self, plugin: &str) {
        if self.sessions.remove(plugin).is_some() {
            self.metrics.record_session_stopped();
            info!(%plugin, "Session unregistered");
            self.emit(SessionEvent::SessionUnregistered {
                plugin: plugin.to_string(),
            });
        }
    }

    pub fn session(&self, plugin: &str) -> Option<SessionInfo> {
        self.sessions.get(plugin).map(|e| e.value().clone())
    }

    /// Plugin types with a running session
    pub fn active_sessions(&self) -> Vec<String> {
        let mut plugins: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        plugins.sort();
        plugins
    }

    // =========================================================================
    // Direct Record Creation
    // =========================================================================

    /// Persist a root resource outside of any scan
    ///
    /// Root resources are globally identified and have no parents; an
    /// existing record with the same identity is updated in place.
    pub fn create_root_resource<I, K>(&self, module: &str, class_name: &str, attrs: I) -> Result<RecordId>
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let loaded = self.load_plugin(module)?;
        let resource_type = loaded.resource_type(class_name)?.clone();
        let class_id = loaded.class_id(class_name)?;

        if !resource_type.identifier()?.is_global() {
            return Err(Error::OrderingViolation {
                resource_type: resource_type.name().to_string(),
                reason: "root resources must be globally identified".into(),
            });
        }
        let attrs = attrs.into_iter().map(|(k, v)| (Into::<String>::into(k), v));
        let resource = Resource::new(resource_type, attrs)?;
        resource.validate()?;

        let mut tx = self.store.begin()?;
        let (record_id, created) = tx.get_or_create_record(class_id, &resource.id_str()?, None)?;
        if !created {
            for stale in tx.attributes_of(record_id)?.keys() {
                if resource.get(stale).is_none() {
                    tx.delete_attribute(record_id, stale)?;
                }
            }
        }
        for (name, value) in resource.values() {
            tx.upsert_attribute(record_id, name, value)?;
        }
        tx.commit()?;

        if created {
            self.metrics.record_created(1);
        }
        info!(%module, class = %class_name, %record_id, created, "Root resource persisted");
        Ok(record_id)
    }
}

fn check_loadable(module: &PluginModule, resource_type: &ResourceType) -> Result<()> {
    if resource_type.is_abstract() {
        return Err(Error::Module {
            module: module.name().to_string(),
            reason: format!("resource type {} has no identifier", resource_type.name()),
        });
    }
    if resource_type.module() != module.name() {
        return Err(Error::Module {
            module: module.name().to_string(),
            reason: format!(
                "resource type {} belongs to module {}",
                resource_type.name(),
                resource_type.module()
            ),
        });
    }
    Ok(())
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("loaded", &self.loaded.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::catalog::PluginDescriptor;
    use crate::store::InMemoryStore;
    use crate::testing;
    use assert_matches::assert_matches;

    fn manager_with(module: PluginModule) -> Arc<PluginManager> {
        let manager = PluginManager::new(Arc::new(InMemoryStore::new()));
        manager.provide_module(module);
        manager
    }

    #[test]
    fn test_two_plugin_types_then_fixed() {
        let broken = testing::array_module()
            .plugin(testing::noop_descriptor("SecondPlugin"));
        let manager = manager_with(broken);
        assert_matches!(manager.load_plugin("array"), Err(Error::Module { .. }));

        manager.provide_module(testing::array_module());
        let first = manager.load_plugin("array").unwrap();
        let second = manager.load_plugin("array").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            first.class_id("Array").unwrap(),
            manager.get_resource_class_id("array", "Array").unwrap()
        );
    }

    #[test]
    fn test_class_ids_are_stable_across_managers() {
        let store = Arc::new(InMemoryStore::new());
        let first = PluginManager::new(store.clone());
        first.provide_module(testing::array_module());
        let id = first.load_plugin("array").unwrap().class_id("Disk").unwrap();

        let second = PluginManager::new(store);
        second.provide_module(testing::array_module());
        assert_eq!(second.load_plugin("array").unwrap().class_id("Disk").unwrap(), id);
    }

    #[test]
    fn test_abstract_type_rejected() {
        let module = PluginModule::new("base")
            .resource_type(crate::schema::base::host())
            .plugin(testing::noop_descriptor("BasePlugin"));
        let manager = manager_with(module);
        assert_matches!(manager.load_plugin("base"), Err(Error::Module { reason, .. }) if reason.contains("identifier"));
    }

    #[test]
    fn test_unknown_module() {
        let manager = PluginManager::new(Arc::new(InMemoryStore::new()));
        assert_matches!(manager.load_plugin("missing"), Err(Error::Module { .. }));
        assert_matches!(manager.get_resource_class("missing", "Array"), Err(Error::Module { .. }));
    }

    #[test]
    fn test_second_session_rejected_until_first_stops() {
        let manager = manager_with(testing::array_module());
        let mut events = manager.subscribe();

        let mut first = manager.create_session("array").unwrap();
        assert_matches!(
            manager.create_session("array"),
            Err(Error::SessionAlreadyActive { plugin }) if plugin == testing::ARRAY_PLUGIN
        );
        assert_eq!(manager.active_sessions(), vec![testing::ARRAY_PLUGIN.to_string()]);

        first.stop();
        assert!(manager.active_sessions().is_empty());
        let second = manager.create_session("array").unwrap();
        assert_ne!(second.session_id(), first.session_id());
        drop(second);
        assert!(manager.session(testing::ARRAY_PLUGIN).is_none());

        assert_matches!(events.try_recv(), Ok(SessionEvent::SessionRegistered { .. }));
        assert_matches!(events.try_recv(), Ok(SessionEvent::SessionUnregistered { .. }));
    }

    #[test]
    fn test_create_root_resource_updates_in_place() {
        let manager = manager_with(testing::array_module());
        let first = manager
            .create_root_resource("array", "Array", [("serial", "A1".into()), ("model", "X9".into())])
            .unwrap();
        let second = manager
            .create_root_resource("array", "Array", [("serial", "A1".into())])
            .unwrap();
        assert_eq!(first, second);

        let tx = manager.store().begin().unwrap();
        let attrs = tx.attributes_of(first).unwrap();
        assert_eq!(attrs.get("serial"), Some(&"A1".into()));
        assert!(attrs.get("model").is_none());
        drop(tx);

        assert_matches!(
            manager.create_root_resource("array", "Disk", [("slot", 1.into())]),
            Err(Error::OrderingViolation { .. })
        );
    }

    #[test]
    fn test_descriptor_instantiates_fresh_plugins() {
        let descriptor = PluginDescriptor::new("Counting", || Box::new(testing::ScriptedPlugin::default()));
        let _a = descriptor.instantiate();
        let _b = descriptor.instantiate();
        assert_eq!(descriptor.name(), "Counting");
    }
}
