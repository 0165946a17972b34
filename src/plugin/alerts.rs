//! Alert Tracking
//!
//! Edge-triggered alert state per session. Only transitions are queued for
//! the store; re-asserting the current state is a no-op. Transitions are
//! measured against the last state the store has committed, so a state
//! that flips and flips back before reaching the store queues nothing.

use crate::graph::ResourceHandle;
use std::collections::{BTreeSet, HashMap};

/// Identity of one alert: which resource, which attribute, which condition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlertKey {
    pub resource: ResourceHandle,
    pub attribute: Option<String>,
    pub condition: String,
}

impl AlertKey {
    pub fn new(resource: ResourceHandle, condition: impl Into<String>, attribute: Option<&str>) -> Self {
        Self {
            resource,
            attribute: attribute.map(str::to_string),
            condition: condition.into(),
        }
    }
}

/// Reported and committed state of every alert plus the set of unflushed
/// transitions
#[derive(Debug, Default)]
pub struct AlertTracker {
    states: HashMap<AlertKey, bool>,
    committed: HashMap<AlertKey, bool>,
    dirty: BTreeSet<AlertKey>,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current state of an alert
    ///
    /// An alert never seen before counts as inactive, so only a first
    /// `active = true` is a transition. Returns whether the reported state
    /// changed.
    pub fn notify(&mut self, key: AlertKey, active: bool) -> bool {
        let previous = self.states.get(&key).copied().unwrap_or(false);
        if previous == active {
            return false;
        }
        if self.committed.get(&key).copied().unwrap_or(false) == active {
            self.dirty.remove(&key);
        } else {
            self.dirty.insert(key.clone());
        }
        self.states.insert(key, active);
        true
    }

    pub fn state(&self, key: &AlertKey) -> Option<bool> {
        self.states.get(key).copied()
    }

    /// Transitions waiting to be flushed, in deterministic order
    pub fn dirty_keys(&self) -> Vec<AlertKey> {
        self.dirty.iter().cloned().collect()
    }

    /// Record a transition the store has committed
    pub fn mark_committed(&mut self, key: &AlertKey, active: bool) {
        self.committed.insert(key.clone(), active);
        if self.states.get(key).copied().unwrap_or(false) == active {
            self.dirty.remove(key);
        }
    }

    /// Drop an alert entirely
    pub fn forget(&mut self, key: &AlertKey) {
        self.states.remove(key);
        self.committed.remove(key);
        self.dirty.remove(key);
    }

    /// Drop every alert of a resource that left the cache
    pub fn forget_resource(&mut self, resource: ResourceHandle) {
        self.states.retain(|k, _| k.resource != resource);
        self.committed.retain(|k, _| k.resource != resource);
        self.dirty.retain(|k| k.resource != resource);
    }

    pub fn active_count(&self) -> usize {
        self.states.values().filter(|a| **a).count()
    }
}
