//! Resource Instances
//!
//! A resource is a typed bag of attribute values plus its parent links.
//! Every mutation goes through the accessors here so that the dirty set
//! always describes exactly what changed since the last persist.

use crate::domain::ports::RecordId;
use crate::error::{Error, Result};
use crate::schema::{AttributeValue, ResourceType, StatisticValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Resource Handle
// =============================================================================

/// Session-scoped handle of a registered resource
///
/// Allocated from a per-session counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(pub(crate) u64);

impl ResourceHandle {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Resource
// =============================================================================

/// An instance of a resource type
#[derive(Debug, Clone)]
pub struct Resource {
    resource_type: Arc<ResourceType>,
    values: BTreeMap<String, AttributeValue>,
    parents: Vec<ResourceHandle>,
    /// Parents detached since the last persist whose edges must be removed
    removed_parents: Vec<ResourceHandle>,
    dirty_attributes: BTreeSet<String>,
    parents_dirty: bool,
    statistics: BTreeMap<String, StatisticValue>,
    handle: Option<ResourceHandle>,
    record_id: Option<RecordId>,
    /// Created without parents; exempt from orphan culling
    root: bool,
}

impl Resource {
    /// Create an unregistered instance from attribute values
    pub fn new<I, K>(resource_type: Arc<ResourceType>, attrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let mut resource = Self {
            resource_type,
            values: BTreeMap::new(),
            parents: Vec::new(),
            removed_parents: Vec::new(),
            dirty_attributes: BTreeSet::new(),
            parents_dirty: false,
            statistics: BTreeMap::new(),
            handle: None,
            record_id: None,
            root: false,
        };
        for (name, value) in attrs {
            resource.set(name.into(), value)?;
        }
        Ok(resource)
    }

    pub fn resource_type(&self) -> &Arc<ResourceType> {
        &self.resource_type
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        self.handle
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, AttributeValue> {
        &self.values
    }

    /// Set an attribute, marking it dirty only if the value changed
    ///
    /// Returns whether the stored value changed.
    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) -> Result<bool> {
        let name = name.into();
        self.check_attribute(&name)?;
        if self.values.get(&name) == Some(&value) {
            return Ok(false);
        }
        self.values.insert(name.clone(), value);
        self.dirty_attributes.insert(name);
        Ok(true)
    }

    /// Remove an attribute value; the store copy is deleted on next persist
    pub fn unset(&mut self, name: &str) -> Result<bool> {
        self.check_attribute(name)?;
        if self.values.remove(name).is_none() {
            return Ok(false);
        }
        self.dirty_attributes.insert(name.to_string());
        Ok(true)
    }

    fn check_attribute(&self, name: &str) -> Result<()> {
        if self.resource_type.attribute(name).is_none() {
            return Err(Error::UnknownAttribute {
                resource_type: self.resource_type.name().to_string(),
                attribute: name.to_string(),
            });
        }
        Ok(())
    }

    /// Validate every set value and require all mandatory attributes
    pub fn validate(&self) -> Result<()> {
        for (name, value) in &self.values {
            if let Some(def) = self.resource_type.attribute(name) {
                def.validate(name, value)?;
            }
        }
        for (name, def) in self.resource_type.attributes() {
            if !def.optional && !self.values.contains_key(name) {
                return Err(Error::MissingMandatoryAttribute {
                    resource_type: self.resource_type.name().to_string(),
                    attribute: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Serialized identity from the identifier fields
    pub fn id_str(&self) -> Result<String> {
        self.resource_type
            .identifier()?
            .id_str(self.resource_type.name(), &self.values)
    }

    pub fn parents(&self) -> &[ResourceHandle] {
        &self.parents
    }

    /// Add a parent link; adding an existing parent is a no-op
    pub fn add_parent(&mut self, parent: ResourceHandle) -> bool {
        if self.parents.contains(&parent) {
            return false;
        }
        self.removed_parents.retain(|p| *p != parent);
        self.parents.push(parent);
        self.parents_dirty = true;
        true
    }

    /// Detach a parent; the edge is removed from the store on next persist
    pub fn remove_parent(&mut self, parent: ResourceHandle) -> bool {
        let before = self.parents.len();
        self.parents.retain(|p| *p != parent);
        if self.parents.len() == before {
            return false;
        }
        if !self.removed_parents.contains(&parent) {
            self.removed_parents.push(parent);
        }
        self.parents_dirty = true;
        true
    }

    /// Drop a parent whose record no longer exists, without scheduling edge removal
    pub(crate) fn forget_parent(&mut self, parent: ResourceHandle) {
        self.parents.retain(|p| *p != parent);
        self.removed_parents.retain(|p| *p != parent);
    }

    pub fn removed_parents(&self) -> &[ResourceHandle] {
        &self.removed_parents
    }

    pub fn dirty_attributes(&self) -> &BTreeSet<String> {
        &self.dirty_attributes
    }

    pub fn parents_dirty(&self) -> bool {
        self.parents_dirty
    }

    /// True if anything needs persisting
    pub fn is_dirty(&self) -> bool {
        !self.dirty_attributes.is_empty()
            || self.parents_dirty
            || !self.statistics.is_empty()
            || self.record_id.is_none()
    }

    /// Buffer the latest sample for a declared statistic
    pub fn update_statistic(&mut self, name: &str, value: StatisticValue) -> Result<()> {
        let def = self
            .resource_type
            .statistic(name)
            .ok_or_else(|| Error::UnknownStatistic {
                resource_type: self.resource_type.name().to_string(),
                statistic: name.to_string(),
            })?;
        def.validate(name, &value)?;
        self.statistics.insert(name.to_string(), value);
        Ok(())
    }

    pub fn pending_statistics(&self) -> &BTreeMap<String, StatisticValue> {
        &self.statistics
    }

    /// Forget everything persisted by a successful flush
    pub(crate) fn mark_persisted(&mut self, record_id: RecordId) {
        self.record_id = Some(record_id);
        self.dirty_attributes.clear();
        self.removed_parents.clear();
        self.parents_dirty = false;
        self.statistics.clear();
    }

    pub(crate) fn assign_handle(&mut self, handle: ResourceHandle) {
        self.root = self.parents.is_empty();
        self.handle = Some(handle);
    }

    /// Instance rebuilt from a persisted record: clean, with a known record id
    pub(crate) fn from_record(
        resource_type: Arc<ResourceType>,
        values: BTreeMap<String, AttributeValue>,
        record_id: RecordId,
    ) -> Self {
        Self {
            resource_type,
            values,
            parents: Vec::new(),
            removed_parents: Vec::new(),
            dirty_attributes: BTreeSet::new(),
            parents_dirty: false,
            statistics: BTreeMap::new(),
            handle: None,
            record_id: Some(record_id),
            root: false,
        }
    }

    pub(crate) fn set_materialized_parents(&mut self, parents: Vec<ResourceHandle>) {
        self.parents = parents;
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle {
            Some(h) => write!(f, "<{} {}>", self.resource_type.name(), h),
            None => write!(f, "<{} unregistered>", self.resource_type.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;

    #[test]
    fn test_unknown_attribute_rejected() {
        let result = Resource::new(testing::array_type(), [("colour", "red".into())]);
        assert_matches!(
            result,
            Err(Error::UnknownAttribute { attribute, .. }) if attribute == "colour"
        );
    }

    #[test]
    fn test_set_same_value_is_not_dirty() {
        let mut array = Resource::new(testing::array_type(), [("serial", "A1".into())]).unwrap();
        array.mark_persisted(RecordId(1));
        assert!(!array.is_dirty());

        assert!(!array.set("serial", "A1".into()).unwrap());
        assert!(array.dirty_attributes().is_empty());

        assert!(array.set("serial", "A2".into()).unwrap());
        assert!(array.dirty_attributes().contains("serial"));

        array.mark_persisted(RecordId(1));
        assert!(array.dirty_attributes().is_empty());
    }

    #[test]
    fn test_unset_marks_dirty() {
        let mut array = Resource::new(
            testing::array_type(),
            [("serial", "A1".into()), ("model", "X9".into())],
        )
        .unwrap();
        array.mark_persisted(RecordId(1));

        assert!(array.unset("model").unwrap());
        assert!(array.get("model").is_none());
        assert!(array.dirty_attributes().contains("model"));
        assert!(!array.unset("model").unwrap());
    }

    #[test]
    fn test_validate_missing_mandatory() {
        let array = Resource::new(testing::array_type(), [("model", "X9".into())]).unwrap();
        assert_matches!(
            array.validate(),
            Err(Error::MissingMandatoryAttribute { attribute, .. }) if attribute == "serial"
        );
    }

    #[test]
    fn test_parent_links_are_idempotent() {
        let mut disk = Resource::new(testing::disk_type(), [("slot", 3.into())]).unwrap();
        assert!(disk.add_parent(ResourceHandle(1)));
        assert!(!disk.add_parent(ResourceHandle(1)));
        assert_eq!(disk.parents(), &[ResourceHandle(1)]);

        assert!(disk.remove_parent(ResourceHandle(1)));
        assert_eq!(disk.removed_parents(), &[ResourceHandle(1)]);
        assert!(disk.parents_dirty());
    }

    #[test]
    fn test_statistics_are_validated() {
        let mut disk = Resource::new(testing::disk_type(), [("slot", 3.into())]).unwrap();
        assert!(disk
            .update_statistic("read_bytes", StatisticValue::Scalar(4096.0))
            .is_ok());
        assert!(disk
            .update_statistic("read_bytes", StatisticValue::Scalar(-1.0))
            .is_err());
        assert_matches!(
            disk.update_statistic("latency", StatisticValue::Scalar(1.0)),
            Err(Error::UnknownStatistic { .. })
        );
    }
}
