//! Resource Query
//!
//! Read-side view of the persisted graph. Records are materialized as a
//! tree starting from the parentless records of a module's classes.

use crate::domain::ports::{RecordId, StoreTransaction};
use crate::error::{Error, Result};
use crate::manager::PluginManager;
use crate::schema::AttributeValue;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// One persisted record with its descendants
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceNode {
    pub record_id: RecordId,
    pub module: String,
    pub class_name: String,
    pub id_str: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ResourceNode>,
}

impl ResourceNode {
    /// Number of nodes in this subtree
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(ResourceNode::count).sum::<usize>()
    }

    pub fn find(&self, class_name: &str) -> Vec<&ResourceNode> {
        let mut found = Vec::new();
        if self.class_name == class_name {
            found.push(self);
        }
        for child in &self.children {
            found.extend(child.find(class_name));
        }
        found
    }
}

/// Queries over the persisted graph
pub struct ResourceQuery<'a> {
    manager: &'a PluginManager,
}

impl<'a> ResourceQuery<'a> {
    pub fn new(manager: &'a PluginManager) -> Self {
        Self { manager }
    }

    /// Every parentless record of the module's classes, with its subtree
    ///
    /// A record reachable through several parents appears under each of
    /// them.
    pub fn resource_tree(&self, module: &str) -> Result<Vec<ResourceNode>> {
        let loaded = self.manager.load_plugin(module)?;
        let tx = self.manager.store().begin()?;

        let mut roots = Vec::new();
        for class in loaded.classes() {
            for record_id in tx.records_of_class(class.class_id)? {
                if tx.parents_of(record_id)?.is_empty() {
                    let mut path = HashSet::new();
                    if let Some(node) = build_node(&*tx, record_id, &mut path)? {
                        roots.push(node);
                    }
                }
            }
        }
        roots.sort_by_key(|n| n.record_id);
        Ok(roots)
    }

    /// Total number of persisted records under the module's roots
    pub fn count(&self, module: &str) -> Result<usize> {
        Ok(self.resource_tree(module)?.iter().map(ResourceNode::count).sum())
    }
}

fn build_node(
    tx: &(dyn StoreTransaction + '_),
    record_id: RecordId,
    path: &mut HashSet<RecordId>,
) -> Result<Option<ResourceNode>> {
    if !path.insert(record_id) {
        return Ok(None);
    }
    let record = tx.record(record_id)?.ok_or(Error::RecordNotFound(record_id))?;
    let class = tx
        .class(record.class_id)?
        .ok_or_else(|| Error::store("class", format!("{} has no class", record_id)))?;

    let mut children = Vec::new();
    for child in tx.children_of(record_id)? {
        if let Some(node) = build_node(tx, child, path)? {
            children.push(node);
        }
    }
    path.remove(&record_id);

    Ok(Some(ResourceNode {
        record_id,
        module: class.module,
        class_name: class.class_name,
        id_str: record.id_str,
        attributes: tx.attributes_of(record_id)?,
        children,
    }))
}
