//! Identifier Strategies
//!
//! Every concrete resource type declares how its instances are told apart:
//! globally by a set of attribute values, or locally within the scope of an
//! ancestor of a given type.

use crate::error::{Error, Result};
use crate::schema::attributes::AttributeValue;
use std::collections::BTreeMap;

/// Identity strategy of a resource type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// Unique across the whole system by the listed attributes
    Global { fields: Vec<String> },
    /// Unique by the listed attributes within the nearest ancestor of type `scope`
    Local { scope: String, fields: Vec<String> },
}

impl Identifier {
    pub fn global<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Identifier::Global {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn local<I, S>(scope: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Identifier::Local {
            scope: scope.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        match self {
            Identifier::Global { fields } | Identifier::Local { fields, .. } => fields,
        }
    }

    /// Type name of the scope ancestor, for local identifiers
    pub fn scope_type(&self) -> Option<&str> {
        match self {
            Identifier::Global { .. } => None,
            Identifier::Local { scope, .. } => Some(scope),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Identifier::Global { .. })
    }

    /// Serialize the identifier field values, in declaration order, as a JSON array
    pub fn id_str(
        &self,
        resource_type: &str,
        values: &BTreeMap<String, AttributeValue>,
    ) -> Result<String> {
        let ordered = self
            .fields()
            .iter()
            .map(|f| {
                values.get(f).ok_or_else(|| Error::MissingMandatoryAttribute {
                    resource_type: resource_type.to_string(),
                    attribute: f.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_string(&ordered)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn values(pairs: &[(&str, AttributeValue)]) -> BTreeMap<String, AttributeValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_id_str_is_order_sensitive() {
        let attrs = values(&[("enclosure", 1.into()), ("slot", 2.into())]);

        let a = Identifier::global(["enclosure", "slot"]).id_str("Disk", &attrs).unwrap();
        let b = Identifier::global(["slot", "enclosure"]).id_str("Disk", &attrs).unwrap();
        assert_eq!(a, "[1,2]");
        assert_eq!(b, "[2,1]");
    }

    #[test]
    fn test_id_str_is_type_preserving() {
        let id = Identifier::local("Array", ["slot"]);
        let int = id.id_str("Disk", &values(&[("slot", 3.into())])).unwrap();
        let text = id.id_str("Disk", &values(&[("slot", "3".into())])).unwrap();
        assert_ne!(int, text);
        assert_eq!(id.scope_type(), Some("Array"));
    }

    #[test]
    fn test_id_str_missing_field() {
        let id = Identifier::global(["serial"]);
        assert_matches!(
            id.id_str("Array", &BTreeMap::new()),
            Err(Error::MissingMandatoryAttribute { attribute, .. }) if attribute == "serial"
        );
    }
}
