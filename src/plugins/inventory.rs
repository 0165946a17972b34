//! Inventory Plugin
//!
//! Reports hosts, controllers, disks and storage pools from a YAML file:
//!
//! ```yaml
//! resources:
//!   - type: Host
//!     attributes: { hostname: node-1 }
//!     children:
//!       - type: Controller
//!         attributes: { name: hba0 }
//!         children:
//!           - type: Disk
//!             attributes: { serial: S1, status: ok, temperature: 34.5 }
//!             statistics: { read_bytes: 1048576 }
//! ```
//!
//! Every periodic update re-reads the file. Resources that disappeared from
//! it are unregistered and culled at the next flush.

use crate::domain::ports::StoragePlugin;
use crate::graph::ResourceHandle;
use crate::manager::{PluginDescriptor, PluginModule};
use crate::plugin::ScanContext;
use crate::schema::{
    base, AlertCondition, AttributeDef, AttributeValue, Identifier, ResourceType, StatisticDef,
    StatisticValue,
};
use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const INVENTORY_MODULE: &str = "inventory";
pub const INVENTORY_PLUGIN: &str = "InventoryPlugin";

/// Disks hotter than this raise `too_hot` (degrees Celsius)
const DISK_TEMPERATURE_LIMIT: f64 = 55.0;

// =============================================================================
// File Format
// =============================================================================

/// Parsed inventory file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryFile {
    #[serde(default)]
    pub resources: Vec<InventoryEntry>,
}

/// One resource and the resources below it
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryEntry {
    #[serde(rename = "type")]
    pub class_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub statistics: BTreeMap<String, f64>,
    #[serde(default)]
    pub children: Vec<InventoryEntry>,
}

impl InventoryFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading inventory {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing inventory {}", path.display()))
    }
}

// =============================================================================
// Resource Types
// =============================================================================

fn host_type() -> anyhow::Result<Arc<ResourceType>> {
    Ok(ResourceType::builder(INVENTORY_MODULE, "Host")
        .extends(&base::host())
        .identifier(Identifier::global(["hostname"]))
        .attribute("hostname", AttributeDef::host_name().label("Host name"))
        .attribute("os", AttributeDef::string().optional())
        .build()?)
}

fn controller_type() -> anyhow::Result<Arc<ResourceType>> {
    Ok(ResourceType::builder(INVENTORY_MODULE, "Controller")
        .extends(&base::controller())
        .identifier(Identifier::local("Host", ["name"]))
        .attribute("name", AttributeDef::string().max_length(64))
        .attribute("model", AttributeDef::string().optional())
        .build()?)
}

fn disk_type() -> anyhow::Result<Arc<ResourceType>> {
    Ok(ResourceType::builder(INVENTORY_MODULE, "Disk")
        .extends(&base::physical_disk())
        .identifier(Identifier::local("Controller", ["serial"]))
        .attribute("serial", AttributeDef::string())
        .attribute("size", AttributeDef::bytes().optional())
        .attribute(
            "status",
            AttributeDef::enumeration(["ok", "degraded", "failed"]).optional(),
        )
        .attribute("temperature", AttributeDef::float().optional().label("Temperature (C)"))
        .statistic("read_bytes", StatisticDef::counter().units("bytes"))
        .statistic("write_bytes", StatisticDef::counter().units("bytes"))
        .alert(
            AlertCondition::value_in("disk_failed", "status", ["degraded", "failed"])
                .message("Disk reports a failure"),
        )
        .alert(
            AlertCondition::upper_bound("too_hot", "temperature", DISK_TEMPERATURE_LIMIT)
                .message("Disk temperature over limit"),
        )
        .build()?)
}

fn pool_type() -> anyhow::Result<Arc<ResourceType>> {
    Ok(ResourceType::builder(INVENTORY_MODULE, "StoragePool")
        .extends(&base::storage_pool())
        .identifier(Identifier::local("Host", ["name"]))
        .attribute("name", AttributeDef::string())
        .attribute("capacity", AttributeDef::bytes().optional())
        .statistic("used_bytes", StatisticDef::gauge().units("bytes"))
        .build()?)
}

/// The inventory module, its plugin reading `path`
pub fn inventory_module(path: impl Into<PathBuf>) -> anyhow::Result<PluginModule> {
    let path = path.into();
    let descriptor = PluginDescriptor::new(INVENTORY_PLUGIN, move || {
        Box::new(InventoryPlugin::new(path.clone()))
    });
    Ok(PluginModule::new(INVENTORY_MODULE)
        .resource_type(host_type()?)
        .resource_type(controller_type()?)
        .resource_type(disk_type()?)
        .resource_type(pool_type()?)
        .plugin(descriptor))
}

// =============================================================================
// Plugin
// =============================================================================

/// Reports the resources listed in an inventory file
#[derive(Debug)]
pub struct InventoryPlugin {
    path: PathBuf,
    /// Handles reported by the previous scan
    reported: BTreeSet<ResourceHandle>,
}

impl InventoryPlugin {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            reported: BTreeSet::new(),
        }
    }

    fn sync(&mut self, ctx: &ScanContext<'_>) -> anyhow::Result<()> {
        let inventory = InventoryFile::load(&self.path)?;

        let mut seen = BTreeSet::new();
        for entry in &inventory.resources {
            report(ctx, entry, None, &mut seen)?;
        }

        let gone: Vec<ResourceHandle> = self.reported.difference(&seen).copied().collect();
        for handle in gone {
            // Already dropped if an ancestor went first
            if ctx.resource(handle).is_ok() {
                debug!(%handle, "Resource left the inventory");
                ctx.unregister_resource(handle)?;
            }
        }

        info!(path = %self.path.display(), resources = seen.len(), "Inventory synchronized");
        self.reported = seen;
        Ok(())
    }
}

impl StoragePlugin for InventoryPlugin {
    fn initial_scan(&mut self, ctx: &ScanContext<'_>) -> anyhow::Result<()> {
        self.sync(ctx)
    }

    fn update_scan(&mut self, ctx: &ScanContext<'_>) -> anyhow::Result<()> {
        self.sync(ctx)
    }
}

fn report(
    ctx: &ScanContext<'_>,
    entry: &InventoryEntry,
    parent: Option<ResourceHandle>,
    seen: &mut BTreeSet<ResourceHandle>,
) -> anyhow::Result<()> {
    let parents: Vec<ResourceHandle> = parent.into_iter().collect();
    let (handle, created) = ctx
        .update_or_create(&entry.class_name, &parents, entry.attributes.clone())
        .with_context(|| format!("reporting {} {:?}", entry.class_name, entry.attributes))?;
    if created {
        debug!(class = %entry.class_name, %handle, "New inventory resource");
    }

    let current = ctx.resource(handle)?;
    let dropped: Vec<String> = current
        .values()
        .keys()
        .filter(|name| !entry.attributes.contains_key(*name))
        .cloned()
        .collect();
    for name in dropped {
        ctx.unset_attribute(handle, &name)?;
    }
    for stale in current.parents().iter().filter(|p| !parents.contains(p)) {
        ctx.remove_parent(handle, *stale)?;
    }

    for (name, value) in &entry.statistics {
        ctx.update_statistic(handle, name, StatisticValue::Scalar(*value))?;
    }

    seen.insert(handle);
    for child in &entry.children {
        report(ctx, child, Some(handle), seen)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::manager::{PluginManager, ResourceQuery};
    use crate::plugin::SessionState;
    use crate::store::InMemoryStore;
    use assert_matches::assert_matches;
    use std::io::{Seek, Write};
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
resources:
  - type: Host
    attributes: { hostname: node-1, os: linux }
    children:
      - type: Controller
        attributes: { name: hba0 }
        children:
          - type: Disk
            attributes: { serial: S1, status: ok, temperature: 30.5 }
            statistics: { read_bytes: 4096 }
          - type: Disk
            attributes: { serial: S2, status: ok }
      - type: StoragePool
        attributes: { name: tank, capacity: 1000000 }
"#;

    const REDUCED: &str = r#"
resources:
  - type: Host
    attributes: { hostname: node-1 }
    children:
      - type: Controller
        attributes: { name: hba0 }
        children:
          - type: Disk
            attributes: { serial: S1, status: failed, temperature: 30.5 }
"#;

    fn write(file: &mut NamedTempFile, content: &str) {
        let handle = file.as_file_mut();
        handle.set_len(0).unwrap();
        handle.rewind().unwrap();
        handle.write_all(content.as_bytes()).unwrap();
        handle.flush().unwrap();
    }

    fn setup(content: &str) -> (NamedTempFile, Arc<PluginManager>, Arc<InMemoryStore>) {
        let mut file = NamedTempFile::new().unwrap();
        write(&mut file, content);
        let store = Arc::new(InMemoryStore::new());
        let manager = PluginManager::new(store.clone());
        manager.provide_module(inventory_module(file.path()).unwrap());
        (file, manager, store)
    }

    #[test]
    fn test_parse_inventory() {
        let parsed: InventoryFile = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(parsed.resources.len(), 1);
        let host = &parsed.resources[0];
        assert_eq!(host.class_name, "Host");
        assert_eq!(host.children.len(), 2);
        let disk = &host.children[0].children[0];
        assert_eq!(disk.attributes.get("temperature"), Some(&AttributeValue::Float(30.5)));
        assert_eq!(disk.statistics.get("read_bytes"), Some(&4096.0));
    }

    #[test]
    fn test_initial_scan_persists_inventory() {
        let (_file, manager, store) = setup(FULL);
        let mut session = manager.create_session(INVENTORY_MODULE).unwrap();
        let report = session.initial_scan().unwrap();

        assert_eq!(report.created, 5);
        assert_eq!(store.record_count(), 5);
        let tree = ResourceQuery::new(&manager).resource_tree(INVENTORY_MODULE).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].find("Disk").len(), 2);
        assert_eq!(tree[0].find("StoragePool").len(), 1);

        let disk = store.find_record(INVENTORY_MODULE, "Disk", r#"["S1"]"#).unwrap();
        assert!(store.committed_statistic(disk, "read_bytes").is_some());
        assert!(store.alert_log().is_empty());
    }

    #[test]
    fn test_update_follows_file_changes() {
        let (mut file, manager, store) = setup(FULL);
        let mut session = manager.create_session(INVENTORY_MODULE).unwrap();
        session.initial_scan().unwrap();
        let host = store.find_record(INVENTORY_MODULE, "Host", r#"["node-1"]"#).unwrap();
        let s2 = store.find_record(INVENTORY_MODULE, "Disk", r#"["S2"]"#).unwrap();
        let pool = store.find_record(INVENTORY_MODULE, "StoragePool", r#"["tank"]"#).unwrap();

        write(&mut file, REDUCED);
        let report = session.update_scan().unwrap();

        assert_eq!(report.culled, 2);
        assert!(!store.contains(s2));
        assert!(!store.contains(pool));
        assert!(store.committed_attributes(host).get("os").is_none());

        let alerts = store.alert_log();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].condition, "disk_failed");
        assert!(alerts[0].active);
    }

    #[test]
    fn test_unreadable_inventory_breaks_plugin() {
        let store = Arc::new(InMemoryStore::new());
        let manager = PluginManager::new(store);
        manager.provide_module(inventory_module("/nonexistent/inventory.yaml").unwrap());
        let mut session = manager.create_session(INVENTORY_MODULE).unwrap();

        let err = session.initial_scan().unwrap_err();
        assert_matches!(&err, Error::PluginBroken { reason, .. } if reason.contains("reading inventory"));
        assert_eq!(session.state(), SessionState::Broken);
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let (_file, manager, _store) = setup("resources:\n  - type: Fan\n    attributes: {}\n");
        let mut session = manager.create_session(INVENTORY_MODULE).unwrap();
        assert_matches!(session.initial_scan(), Err(Error::PluginBroken { .. }));
    }
}
