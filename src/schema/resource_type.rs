//! Resource Types
//!
//! A resource type is a named schema: attributes, statistics and alert
//! conditions merged from the type's ancestors plus its own declarations,
//! and the identifier strategy used to deduplicate instances.

use crate::error::{Error, Result};
use crate::schema::attributes::AttributeDef;
use crate::schema::base::BASE_MODULE;
use crate::schema::conditions::AlertCondition;
use crate::schema::identifier::Identifier;
use crate::schema::statistics::StatisticDef;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Resource Type
// =============================================================================

/// Fully merged schema of a resource type
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceType {
    name: String,
    module: String,
    human_name: Option<String>,
    /// This type followed by its ancestors, nearest first, as (module, name)
    lineage: Vec<(String, String)>,
    identifier: Option<Identifier>,
    attributes: IndexMap<String, AttributeDef>,
    statistics: IndexMap<String, StatisticDef>,
    alert_conditions: IndexMap<String, AlertCondition>,
}

impl ResourceType {
    /// Start declaring a type that belongs to `module`
    pub fn builder(module: impl Into<String>, name: impl Into<String>) -> ResourceTypeBuilder {
        ResourceTypeBuilder::new(module.into(), name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Display name, falling back to the type name
    pub fn human_name(&self) -> &str {
        self.human_name.as_deref().unwrap_or(&self.name)
    }

    /// True if this type is `type_name` or derives from it, with a bare
    /// name resolved in this type's own module
    pub fn is_a(&self, type_name: &str) -> bool {
        self.is_a_in(&self.module, type_name)
    }

    /// True if this type is `type_name` or derives from it
    ///
    /// A qualified `module.Name` matches only that module's type. A bare
    /// name matches the type of that name in `module` or among the base
    /// types.
    pub fn is_a_in(&self, module: &str, type_name: &str) -> bool {
        match type_name.split_once('.') {
            Some((qualifier, name)) => self
                .lineage
                .iter()
                .any(|(m, n)| m == qualifier && n == name),
            None => self
                .lineage
                .iter()
                .any(|(m, n)| n == type_name && (m == module || m == BASE_MODULE)),
        }
    }

    pub fn lineage(&self) -> &[(String, String)] {
        &self.lineage
    }

    /// Identifier strategy; abstract types have none
    pub fn identifier(&self) -> Result<&Identifier> {
        self.identifier.as_ref().ok_or_else(|| Error::Schema {
            resource_type: self.name.clone(),
            reason: "abstract type has no identifier".into(),
        })
    }

    pub fn is_abstract(&self) -> bool {
        self.identifier.is_none()
    }

    pub fn attributes(&self) -> &IndexMap<String, AttributeDef> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.get(name)
    }

    pub fn statistics(&self) -> &IndexMap<String, StatisticDef> {
        &self.statistics
    }

    pub fn statistic(&self, name: &str) -> Option<&StatisticDef> {
        self.statistics.get(name)
    }

    pub fn alert_conditions(&self) -> impl Iterator<Item = &AlertCondition> {
        self.alert_conditions.values()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects a type's own declarations and merges them over its base
#[derive(Debug)]
pub struct ResourceTypeBuilder {
    name: String,
    module: String,
    human_name: Option<String>,
    base: Option<Arc<ResourceType>>,
    identifier: Option<Identifier>,
    attributes: IndexMap<String, AttributeDef>,
    statistics: IndexMap<String, StatisticDef>,
    alert_conditions: IndexMap<String, AlertCondition>,
}

impl ResourceTypeBuilder {
    fn new(module: String, name: String) -> Self {
        Self {
            name,
            module,
            human_name: None,
            base: None,
            identifier: None,
            attributes: IndexMap::new(),
            statistics: IndexMap::new(),
            alert_conditions: IndexMap::new(),
        }
    }

    /// Inherit everything declared by `base` and its ancestors
    pub fn extends(mut self, base: &Arc<ResourceType>) -> Self {
        self.base = Some(Arc::clone(base));
        self
    }

    pub fn human_name(mut self, name: impl Into<String>) -> Self {
        self.human_name = Some(name.into());
        self
    }

    pub fn identifier(mut self, identifier: Identifier) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, def: AttributeDef) -> Self {
        self.attributes.insert(name.into(), def);
        self
    }

    pub fn statistic(mut self, name: impl Into<String>, def: StatisticDef) -> Self {
        self.statistics.insert(name.into(), def);
        self
    }

    pub fn alert(mut self, condition: AlertCondition) -> Self {
        self.alert_conditions
            .insert(condition.name().to_string(), condition);
        self
    }

    /// Merge with the base schema and check internal consistency
    pub fn build(self) -> Result<Arc<ResourceType>> {
        let mut lineage = vec![(self.module.clone(), self.name.clone())];
        let mut attributes = IndexMap::new();
        let mut statistics = IndexMap::new();
        let mut alert_conditions = IndexMap::new();
        let mut identifier = None;
        let mut human_name = None;

        if let Some(base) = &self.base {
            lineage.extend(base.lineage.iter().cloned());
            attributes.extend(base.attributes.clone());
            statistics.extend(base.statistics.clone());
            alert_conditions.extend(base.alert_conditions.clone());
            identifier = base.identifier.clone();
            human_name = base.human_name.clone();
        }

        // Own declarations override inherited ones of the same name
        attributes.extend(self.attributes);
        statistics.extend(self.statistics);
        alert_conditions.extend(self.alert_conditions);
        let identifier = self.identifier.or(identifier);
        let human_name = self.human_name.or(human_name);

        let schema_error = |reason: String| Error::Schema {
            resource_type: self.name.clone(),
            reason,
        };

        if let Some(id) = &identifier {
            if id.fields().is_empty() {
                return Err(schema_error("identifier declares no fields".into()));
            }
            for field in id.fields() {
                if !attributes.contains_key(field) {
                    return Err(schema_error(format!(
                        "identifier field {} is not a declared attribute",
                        field
                    )));
                }
            }
            if let Some(scope) = id.scope_type() {
                if scope.is_empty() {
                    return Err(schema_error("local identifier has an empty scope type".into()));
                }
            }
        }

        for condition in alert_conditions.values() {
            let attribute = condition.test_kind().attribute();
            if !attributes.contains_key(attribute) {
                return Err(schema_error(format!(
                    "alert condition {} references unknown attribute {}",
                    condition.name(),
                    attribute
                )));
            }
        }

        Ok(Arc::new(ResourceType {
            name: self.name,
            module: self.module,
            human_name,
            lineage,
            identifier,
            attributes,
            statistics,
            alert_conditions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn disk_base() -> Arc<ResourceType> {
        ResourceType::builder("base", "PhysicalDisk")
            .human_name("Physical disk")
            .attribute("size", AttributeDef::bytes())
            .attribute("status", AttributeDef::string().optional())
            .statistic("read_bytes", StatisticDef::counter())
            .build()
            .unwrap()
    }

    #[test]
    fn test_inheritance_is_additive() {
        let base = disk_base();
        let disk = ResourceType::builder("array", "Disk")
            .extends(&base)
            .attribute("slot", AttributeDef::integer())
            .identifier(Identifier::local("Array", ["slot"]))
            .build()
            .unwrap();

        assert!(disk.attribute("size").is_some());
        assert!(disk.attribute("slot").is_some());
        assert!(disk.statistic("read_bytes").is_some());
        assert!(disk.is_a("PhysicalDisk"));
        assert!(disk.is_a("Disk"));
        assert!(!disk.is_a("Array"));
        assert_eq!(disk.human_name(), "Physical disk");
        assert!(base.is_abstract());
        assert!(!disk.is_abstract());
    }

    #[test]
    fn test_child_overrides_ancestor_declaration() {
        let base = disk_base();
        let disk = ResourceType::builder("array", "Disk")
            .extends(&base)
            .attribute("status", AttributeDef::enumeration(["OK", "FAILED"]))
            .attribute("serial", AttributeDef::string())
            .identifier(Identifier::global(["serial"]))
            .build()
            .unwrap();

        let status = disk.attribute("status").unwrap();
        assert!(!status.optional);
        assert!(status.validate("status", &"OK".into()).is_ok());
        assert!(status.validate("status", &"weird".into()).is_err());
    }

    #[test]
    fn test_type_may_share_its_base_name() {
        let host = ResourceType::builder("inventory", "Host")
            .extends(&crate::schema::base::host())
            .attribute("hostname", AttributeDef::host_name())
            .identifier(Identifier::global(["hostname"]))
            .build()
            .unwrap();

        assert!(host.is_a("Host"));
        assert!(host.is_a("base.Host"));
        assert!(host.is_a("inventory.Host"));
        assert_eq!(host.lineage().len(), 2);
    }

    #[test]
    fn test_bare_names_do_not_cross_modules() {
        let array = ResourceType::builder("vendor", "Array")
            .attribute("serial", AttributeDef::string())
            .identifier(Identifier::global(["serial"]))
            .build()
            .unwrap();

        assert!(array.is_a("Array"));
        assert!(array.is_a_in("vendor", "Array"));
        assert!(!array.is_a_in("array", "Array"));
        assert!(!array.is_a("array.Array"));
        assert!(array.is_a_in("array", "vendor.Array"));
    }

    #[test]
    fn test_identifier_must_reference_attributes() {
        let result = ResourceType::builder("array", "Disk")
            .identifier(Identifier::global(["serial"]))
            .build();
        assert_matches!(result, Err(Error::Schema { .. }));
    }

    #[test]
    fn test_alert_must_reference_attributes() {
        let result = ResourceType::builder("array", "Disk")
            .attribute("serial", AttributeDef::string())
            .identifier(Identifier::global(["serial"]))
            .alert(AlertCondition::upper_bound("too_hot", "temperature", 60.0))
            .build();
        assert_matches!(result, Err(Error::Schema { .. }));
    }
}
