//! In-Memory Resource Store
//!
//! Transactional reference implementation of the store port. Transactions
//! are serialised: `begin` waits until no other transaction is open, copies
//! the committed state into a working set, and `commit` swaps the working
//! set in. Dropping a transaction discards its working set.

use crate::domain::ports::{ClassId, ClassRecord, RecordId, ResourceStore, StoreTransaction, StoredRecord};
use crate::error::{Error, Result};
use crate::schema::{AttributeValue, StatisticValue};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

// =============================================================================
// Stored Rows
// =============================================================================

/// One alert transition as received by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub record_id: RecordId,
    pub active: bool,
    pub condition: String,
    pub attribute: Option<String>,
    pub at: DateTime<Utc>,
}

/// Latest sample of a statistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticSample {
    pub value: StatisticValue,
    pub at: DateTime<Utc>,
}

type RecordKey = (ClassId, String, Option<RecordId>);

#[derive(Debug, Clone, Default)]
struct StoreState {
    next_class_id: u64,
    next_record_id: u64,
    classes: BTreeMap<ClassId, ClassRecord>,
    class_index: HashMap<(String, String), ClassId>,
    statistic_names: HashMap<ClassId, BTreeSet<String>>,
    records: BTreeMap<RecordId, StoredRecord>,
    record_index: HashMap<RecordKey, RecordId>,
    attributes: HashMap<RecordId, BTreeMap<String, AttributeValue>>,
    parents: HashMap<RecordId, BTreeSet<RecordId>>,
    children: HashMap<RecordId, BTreeSet<RecordId>>,
    statistics: HashMap<RecordId, BTreeMap<String, StatisticSample>>,
    alerts: Vec<AlertNotification>,
}

impl StoreState {
    fn require_record(&self, record_id: RecordId) -> Result<&StoredRecord> {
        self.records
            .get(&record_id)
            .ok_or(Error::RecordNotFound(record_id))
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Transactional in-memory store
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    busy: Mutex<bool>,
    idle: Condvar,
    available: AtomicBool,
    fail_next_commit: AtomicBool,
    commits: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            busy: Mutex::new(false),
            idle: Condvar::new(),
            available: AtomicBool::new(true),
            fail_next_commit: AtomicBool::new(false),
            commits: AtomicU64::new(0),
        }
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Make the next commit fail (for testing)
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::Relaxed);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Committed-State Reads
    // =========================================================================

    /// Every alert transition committed so far, oldest first
    pub fn alert_log(&self) -> Vec<AlertNotification> {
        self.state.lock().alerts.clone()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Committed record of `module.class_name` with the given identity
    pub fn find_record(&self, module: &str, class_name: &str, id_str: &str) -> Option<RecordId> {
        let state = self.state.lock();
        let class_id = state
            .class_index
            .get(&(module.to_string(), class_name.to_string()))?;
        state
            .records
            .values()
            .find(|r| r.class_id == *class_id && r.id_str == id_str)
            .map(|r| r.id)
    }

    pub fn contains(&self, record_id: RecordId) -> bool {
        self.state.lock().records.contains_key(&record_id)
    }

    pub fn committed_attributes(&self, record_id: RecordId) -> BTreeMap<String, AttributeValue> {
        self.state
            .lock()
            .attributes
            .get(&record_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed_parents(&self, record_id: RecordId) -> Vec<RecordId> {
        self.state
            .lock()
            .parents
            .get(&record_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn committed_statistic(&self, record_id: RecordId, name: &str) -> Option<StatisticSample> {
        self.state
            .lock()
            .statistics
            .get(&record_id)
            .and_then(|s| s.get(name))
            .cloned()
    }

    fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.idle.notify_one();
    }
}

impl ResourceStore for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        if !self.is_available() {
            return Err(Error::StoreUnavailable("in-memory store offline".into()));
        }
        {
            let mut busy = self.busy.lock();
            while *busy {
                self.idle.wait(&mut busy);
            }
            *busy = true;
        }
        let working = self.state.lock().clone();
        trace!("Transaction opened");
        Ok(Box::new(MemoryTransaction {
            store: self,
            working,
        }))
    }
}

// =============================================================================
// Transaction
// =============================================================================

struct MemoryTransaction<'s> {
    store: &'s InMemoryStore,
    working: StoreState,
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        self.store.release();
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn get_or_create_class(&mut self, module: &str, class_name: &str) -> Result<ClassId> {
        let key = (module.to_string(), class_name.to_string());
        if let Some(id) = self.working.class_index.get(&key) {
            return Ok(*id);
        }
        self.working.next_class_id += 1;
        let id = ClassId(self.working.next_class_id);
        self.working.classes.insert(
            id,
            ClassRecord {
                id,
                module: module.to_string(),
                class_name: class_name.to_string(),
            },
        );
        self.working.class_index.insert(key, id);
        debug!(%module, %class_name, class_id = %id, "Created resource class");
        Ok(id)
    }

    fn class(&self, class_id: ClassId) -> Result<Option<ClassRecord>> {
        Ok(self.working.classes.get(&class_id).cloned())
    }

    fn register_statistic(&mut self, class_id: ClassId, name: &str) -> Result<()> {
        if !self.working.classes.contains_key(&class_id) {
            return Err(Error::store("register_statistic", format!("unknown {}", class_id)));
        }
        self.working
            .statistic_names
            .entry(class_id)
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    fn get_or_create_record(
        &mut self,
        class_id: ClassId,
        id_str: &str,
        scope_id: Option<RecordId>,
    ) -> Result<(RecordId, bool)> {
        if !self.working.classes.contains_key(&class_id) {
            return Err(Error::store("get_or_create_record", format!("unknown {}", class_id)));
        }
        if let Some(scope_id) = scope_id {
            self.working.require_record(scope_id)?;
        }
        let key = (class_id, id_str.to_string(), scope_id);
        if let Some(id) = self.working.record_index.get(&key) {
            return Ok((*id, false));
        }

        self.working.next_record_id += 1;
        let id = RecordId(self.working.next_record_id);
        self.working.records.insert(
            id,
            StoredRecord {
                id,
                class_id,
                id_str: id_str.to_string(),
                scope_id,
            },
        );
        self.working.record_index.insert(key, id);
        Ok((id, true))
    }

    fn record(&self, record_id: RecordId) -> Result<Option<StoredRecord>> {
        Ok(self.working.records.get(&record_id).cloned())
    }

    fn records_of_class(&self, class_id: ClassId) -> Result<Vec<RecordId>> {
        Ok(self
            .working
            .records
            .values()
            .filter(|r| r.class_id == class_id)
            .map(|r| r.id)
            .collect())
    }

    fn delete_record(&mut self, record_id: RecordId) -> Result<()> {
        let record = self
            .working
            .records
            .remove(&record_id)
            .ok_or(Error::RecordNotFound(record_id))?;
        self.working
            .record_index
            .remove(&(record.class_id, record.id_str, record.scope_id));
        self.working.attributes.remove(&record_id);
        self.working.statistics.remove(&record_id);

        for parent in self.working.parents.remove(&record_id).unwrap_or_default() {
            if let Some(children) = self.working.children.get_mut(&parent) {
                children.remove(&record_id);
            }
        }
        for child in self.working.children.remove(&record_id).unwrap_or_default() {
            if let Some(parents) = self.working.parents.get_mut(&child) {
                parents.remove(&record_id);
            }
        }
        Ok(())
    }

    fn attributes_of(&self, record_id: RecordId) -> Result<BTreeMap<String, AttributeValue>> {
        self.working.require_record(record_id)?;
        Ok(self
            .working
            .attributes
            .get(&record_id)
            .cloned()
            .unwrap_or_default())
    }

    fn upsert_attribute(&mut self, record_id: RecordId, key: &str, value: &AttributeValue) -> Result<()> {
        self.working.require_record(record_id)?;
        self.working
            .attributes
            .entry(record_id)
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete_attribute(&mut self, record_id: RecordId, key: &str) -> Result<()> {
        self.working.require_record(record_id)?;
        if let Some(attributes) = self.working.attributes.get_mut(&record_id) {
            attributes.remove(key);
        }
        Ok(())
    }

    fn add_parent_edge(&mut self, record_id: RecordId, parent_id: RecordId) -> Result<()> {
        self.working.require_record(record_id)?;
        self.working.require_record(parent_id)?;
        self.working
            .parents
            .entry(record_id)
            .or_default()
            .insert(parent_id);
        self.working
            .children
            .entry(parent_id)
            .or_default()
            .insert(record_id);
        Ok(())
    }

    fn remove_parent_edge(&mut self, record_id: RecordId, parent_id: RecordId) -> Result<()> {
        if let Some(parents) = self.working.parents.get_mut(&record_id) {
            parents.remove(&parent_id);
        }
        if let Some(children) = self.working.children.get_mut(&parent_id) {
            children.remove(&record_id);
        }
        Ok(())
    }

    fn children_of(&self, record_id: RecordId) -> Result<Vec<RecordId>> {
        Ok(self
            .working
            .children
            .get(&record_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default())
    }

    fn parents_of(&self, record_id: RecordId) -> Result<Vec<RecordId>> {
        Ok(self
            .working
            .parents
            .get(&record_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default())
    }

    fn notify_alert(
        &mut self,
        record_id: RecordId,
        active: bool,
        condition: &str,
        attribute: Option<&str>,
    ) -> Result<()> {
        self.working.require_record(record_id)?;
        self.working.alerts.push(AlertNotification {
            record_id,
            active,
            condition: condition.to_string(),
            attribute: attribute.map(str::to_string),
            at: Utc::now(),
        });
        Ok(())
    }

    fn update_statistic(&mut self, record_id: RecordId, name: &str, value: &StatisticValue) -> Result<()> {
        let class_id = self.working.require_record(record_id)?.class_id;
        let registered = self
            .working
            .statistic_names
            .get(&class_id)
            .map_or(false, |names| names.contains(name));
        if !registered {
            return Err(Error::store(
                "update_statistic",
                format!("statistic {} is not registered for {}", name, class_id),
            ));
        }
        self.working.statistics.entry(record_id).or_default().insert(
            name.to_string(),
            StatisticSample {
                value: value.clone(),
                at: Utc::now(),
            },
        );
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if self.store.fail_next_commit.swap(false, Ordering::Relaxed) {
            return Err(Error::store("commit", "injected commit failure"));
        }
        *self.store.state.lock() = std::mem::take(&mut self.working);
        self.store.commits.fetch_add(1, Ordering::Relaxed);
        trace!("Transaction committed");
        Ok(())
    }
}
