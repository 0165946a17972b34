//! Alert Conditions
//!
//! Declarative alert conditions evaluated against a resource's current
//! attribute values after every scan.

use crate::schema::attributes::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of testing one condition against one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertResult {
    /// Condition name
    pub name: String,
    /// Attribute the condition looked at
    pub attribute: Option<String>,
    pub active: bool,
}

/// The test an alert condition performs
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTest {
    /// Active while the attribute holds one of the warning values
    ValueIn {
        attribute: String,
        warn_states: Vec<AttributeValue>,
    },
    /// Active while the attribute is strictly above the threshold
    UpperBound { attribute: String, threshold: f64 },
    /// Active while the attribute is strictly below the threshold
    LowerBound { attribute: String, threshold: f64 },
}

impl AlertTest {
    pub fn attribute(&self) -> &str {
        match self {
            AlertTest::ValueIn { attribute, .. }
            | AlertTest::UpperBound { attribute, .. }
            | AlertTest::LowerBound { attribute, .. } => attribute,
        }
    }
}

/// A named alert condition declared on a resource type
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCondition {
    name: String,
    test: AlertTest,
    message: Option<String>,
}

impl AlertCondition {
    pub fn new(name: impl Into<String>, test: AlertTest) -> Self {
        Self {
            name: name.into(),
            test,
            message: None,
        }
    }

    pub fn value_in<I, V>(name: impl Into<String>, attribute: impl Into<String>, warn_states: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<AttributeValue>,
    {
        Self::new(
            name,
            AlertTest::ValueIn {
                attribute: attribute.into(),
                warn_states: warn_states.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn upper_bound(name: impl Into<String>, attribute: impl Into<String>, threshold: f64) -> Self {
        Self::new(
            name,
            AlertTest::UpperBound {
                attribute: attribute.into(),
                threshold,
            },
        )
    }

    pub fn lower_bound(name: impl Into<String>, attribute: impl Into<String>, threshold: f64) -> Self {
        Self::new(
            name,
            AlertTest::LowerBound {
                attribute: attribute.into(),
                threshold,
            },
        )
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test_kind(&self) -> &AlertTest {
        &self.test
    }

    pub fn message_text(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Evaluate against a resource's attribute values
    ///
    /// An absent attribute evaluates as inactive.
    pub fn test(&self, values: &BTreeMap<String, AttributeValue>) -> Vec<AlertResult> {
        let attribute = self.test.attribute();
        let value = values.get(attribute);
        let active = match (&self.test, value) {
            (_, None) => false,
            (AlertTest::ValueIn { warn_states, .. }, Some(v)) => warn_states.contains(v),
            (AlertTest::UpperBound { threshold, .. }, Some(v)) => {
                v.as_f64().map(|n| n > *threshold).unwrap_or(false)
            }
            (AlertTest::LowerBound { threshold, .. }, Some(v)) => {
                v.as_f64().map(|n| n < *threshold).unwrap_or(false)
            }
        };

        vec![AlertResult {
            name: self.name.clone(),
            attribute: Some(attribute.to_string()),
            active,
        }]
    }
}
