//! Domain Ports - Core trait definitions for the resource graph engine
//!
//! These traits define the boundaries between the engine and the systems
//! around it: the persistent store that holds the graph and the plugins that
//! discover resources.

use crate::error::Result;
use crate::plugin::ScanContext;
use crate::schema::{AttributeValue, StatisticValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Identifiers
// =============================================================================

/// Primary key of a persisted resource record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record-{}", self.0)
    }
}

/// Primary key of a persisted resource class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class-{}", self.0)
    }
}

// =============================================================================
// Stored Rows
// =============================================================================

/// A persisted resource class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub id: ClassId,
    pub module: String,
    pub class_name: String,
}

/// A persisted resource record, without attributes or edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    pub class_id: ClassId,
    pub id_str: String,
    pub scope_id: Option<RecordId>,
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for the transactional record/attribute/edge store
pub trait ResourceStore: Send + Sync {
    /// Open a transaction; dropping it without `commit` rolls back
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;
}

// Test-only: lets `assert_matches!` format `Result<Box<dyn StoreTransaction>>`.
#[cfg(test)]
impl std::fmt::Debug for dyn StoreTransaction + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StoreTransaction")
    }
}

/// All store operations, scoped to one atomic transaction
pub trait StoreTransaction: Send {
    // Classes
    fn get_or_create_class(&mut self, module: &str, class_name: &str) -> Result<ClassId>;
    fn class(&self, class_id: ClassId) -> Result<Option<ClassRecord>>;
    fn register_statistic(&mut self, class_id: ClassId, name: &str) -> Result<()>;

    // Records
    fn get_or_create_record(
        &mut self,
        class_id: ClassId,
        id_str: &str,
        scope_id: Option<RecordId>,
    ) -> Result<(RecordId, bool)>;
    fn record(&self, record_id: RecordId) -> Result<Option<StoredRecord>>;
    fn records_of_class(&self, class_id: ClassId) -> Result<Vec<RecordId>>;
    fn delete_record(&mut self, record_id: RecordId) -> Result<()>;

    // Attributes
    fn attributes_of(&self, record_id: RecordId) -> Result<BTreeMap<String, AttributeValue>>;
    fn upsert_attribute(&mut self, record_id: RecordId, key: &str, value: &AttributeValue) -> Result<()>;
    fn delete_attribute(&mut self, record_id: RecordId, key: &str) -> Result<()>;

    // Edges
    fn add_parent_edge(&mut self, record_id: RecordId, parent_id: RecordId) -> Result<()>;
    fn remove_parent_edge(&mut self, record_id: RecordId, parent_id: RecordId) -> Result<()>;
    fn children_of(&self, record_id: RecordId) -> Result<Vec<RecordId>>;
    fn parents_of(&self, record_id: RecordId) -> Result<Vec<RecordId>>;

    // Alerts and statistics
    fn notify_alert(
        &mut self,
        record_id: RecordId,
        active: bool,
        condition: &str,
        attribute: Option<&str>,
    ) -> Result<()>;
    fn update_statistic(&mut self, record_id: RecordId, name: &str, value: &StatisticValue) -> Result<()>;

    /// Make every mutation of this transaction visible atomically
    fn commit(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// Storage Plugin Port
// =============================================================================

/// Contract implemented by discovery plugins
///
/// Both scans run on the session's own thread. Any error escaping
/// `initial_scan` marks the plugin permanently broken; errors from
/// `update_scan` are retried on the next tick.
pub trait StoragePlugin: Send {
    /// Report every resource present right now
    fn initial_scan(&mut self, ctx: &ScanContext<'_>) -> anyhow::Result<()>;

    /// Refresh previously reported resources
    fn update_scan(&mut self, _ctx: &ScanContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceStoreRef = Arc<dyn ResourceStore>;
