//! Shared test fixtures

use crate::domain::ports::StoragePlugin;
use crate::manager::{PluginDescriptor, PluginManager, PluginModule};
use crate::plugin::ScanContext;
use crate::schema::{base, AlertCondition, AttributeDef, Identifier, ResourceType, StatisticDef};
use crate::store::InMemoryStore;
use std::sync::Arc;

pub const ARRAY_MODULE: &str = "array";
pub const ARRAY_PLUGIN: &str = "ArrayPlugin";

// =============================================================================
// Resource Types
// =============================================================================

pub fn array_type() -> Arc<ResourceType> {
    ResourceType::builder(ARRAY_MODULE, "Array")
        .human_name("Storage array")
        .identifier(Identifier::global(["serial"]))
        .attribute("serial", AttributeDef::string())
        .attribute("model", AttributeDef::string().optional())
        .build()
        .unwrap()
}

/// Disk identified by slot within its array
pub fn disk_type() -> Arc<ResourceType> {
    ResourceType::builder(ARRAY_MODULE, "Disk")
        .extends(&base::physical_disk())
        .identifier(Identifier::local("Array", ["slot"]))
        .attribute("slot", AttributeDef::integer().range(Some(0), Some(23)))
        .attribute(
            "status",
            AttributeDef::enumeration(["ok", "failed", "missing"]).optional(),
        )
        .attribute("temperature", AttributeDef::float().optional())
        .statistic("read_bytes", StatisticDef::counter().units("bytes"))
        .alert(AlertCondition::value_in("disk_failed", "status", ["failed"]))
        .alert(AlertCondition::upper_bound("too_hot", "temperature", 60.0))
        .build()
        .unwrap()
}

pub fn shelf_type() -> Arc<ResourceType> {
    ResourceType::builder(ARRAY_MODULE, "Shelf")
        .extends(&base::enclosure())
        .identifier(Identifier::local("Array", ["index"]))
        .attribute("index", AttributeDef::integer())
        .build()
        .unwrap()
}

pub fn host_type() -> Arc<ResourceType> {
    ResourceType::builder(ARRAY_MODULE, "Host")
        .extends(&base::host())
        .identifier(Identifier::global(["hostname"]))
        .attribute("hostname", AttributeDef::host_name())
        .build()
        .unwrap()
}

fn array_types(module: PluginModule) -> PluginModule {
    module
        .resource_type(array_type())
        .resource_type(disk_type())
        .resource_type(shelf_type())
        .resource_type(host_type())
}

/// The array module with a plugin that reports nothing
pub fn array_module() -> PluginModule {
    array_types(PluginModule::new(ARRAY_MODULE)).plugin(noop_descriptor(ARRAY_PLUGIN))
}

// =============================================================================
// Plugins
// =============================================================================

type ScanFn = Box<dyn FnMut(&ScanContext<'_>) -> anyhow::Result<()> + Send>;

/// Plugin whose scans run the closures it was built with
#[derive(Default)]
pub struct ScriptedPlugin {
    initial: Option<ScanFn>,
    update: Option<ScanFn>,
}

impl ScriptedPlugin {
    pub fn on_initial<F>(mut self, scan: F) -> Self
    where
        F: FnMut(&ScanContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.initial = Some(Box::new(scan));
        self
    }

    pub fn on_update<F>(mut self, scan: F) -> Self
    where
        F: FnMut(&ScanContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.update = Some(Box::new(scan));
        self
    }
}

impl StoragePlugin for ScriptedPlugin {
    fn initial_scan(&mut self, ctx: &ScanContext<'_>) -> anyhow::Result<()> {
        match self.initial.as_mut() {
            Some(scan) => scan(ctx),
            None => Ok(()),
        }
    }

    fn update_scan(&mut self, ctx: &ScanContext<'_>) -> anyhow::Result<()> {
        match self.update.as_mut() {
            Some(scan) => scan(ctx),
            None => Ok(()),
        }
    }
}

pub fn noop_descriptor(name: &str) -> PluginDescriptor {
    PluginDescriptor::new(name, || Box::new(ScriptedPlugin::default()))
}

/// Reports array A1 with disks in slots 0 and 1
pub fn array_plugin() -> ScriptedPlugin {
    ScriptedPlugin::default().on_initial(|ctx| {
        let (array, _) = ctx.update_or_create("Array", &[], [("serial", "A1".into())])?;
        for slot in [0, 1] {
            ctx.update_or_create("Disk", &[array], [("slot", slot.into())])?;
        }
        Ok(())
    })
}

/// Manager over a fresh store with the array module loaded, its plugin
/// built by `factory`
pub fn manager_with_plugin<F, P>(factory: F) -> (Arc<PluginManager>, Arc<InMemoryStore>)
where
    F: Fn() -> P + Send + Sync + 'static,
    P: StoragePlugin + 'static,
{
    let store = Arc::new(InMemoryStore::new());
    let manager = PluginManager::new(store.clone());
    let descriptor = PluginDescriptor::new(ARRAY_PLUGIN, move || Box::new(factory()));
    manager.provide_module(array_types(PluginModule::new(ARRAY_MODULE)).plugin(descriptor));
    manager.load_plugin(ARRAY_MODULE).unwrap();
    (manager, store)
}
