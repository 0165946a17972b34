//! Resource Attributes
//!
//! Attribute values carried by resource instances and the typed definitions
//! that validate them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Attribute Value
// =============================================================================

/// A single attribute value
///
/// Serialized untagged so that identity strings stay type-preserving:
/// `3`, `3.0` and `"3"` all encode differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view used by bound conditions
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::Float(_) => "float",
            AttributeValue::String(_) => "string",
            AttributeValue::List(_) => "list",
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Integer(i) => write!(f, "{}", i),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::String(s) => write!(f, "{}", s),
            AttributeValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Integer(v as i64)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Integer(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(v: Vec<T>) -> Self {
        AttributeValue::List(v.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Attribute Kind
// =============================================================================

/// The value domain of an attribute
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeKind {
    String { max_length: Option<usize> },
    Integer { min: Option<i64>, max: Option<i64> },
    Boolean,
    Float,
    Enum { options: Vec<String> },
    /// Size in bytes, rendered as a human readable quantity
    Bytes,
    Uuid,
    PosixPath,
    HostName,
}

// =============================================================================
// Attribute Definition
// =============================================================================

/// Schema entry for a single attribute
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub kind: AttributeKind,
    pub optional: bool,
    pub label: Option<String>,
}

impl AttributeDef {
    fn of(kind: AttributeKind) -> Self {
        Self {
            kind,
            optional: false,
            label: None,
        }
    }

    pub fn string() -> Self {
        Self::of(AttributeKind::String { max_length: None })
    }

    pub fn integer() -> Self {
        Self::of(AttributeKind::Integer {
            min: None,
            max: None,
        })
    }

    pub fn boolean() -> Self {
        Self::of(AttributeKind::Boolean)
    }

    pub fn float() -> Self {
        Self::of(AttributeKind::Float)
    }

    pub fn enumeration<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::of(AttributeKind::Enum {
            options: options.into_iter().map(Into::into).collect(),
        })
    }

    pub fn bytes() -> Self {
        Self::of(AttributeKind::Bytes)
    }

    pub fn uuid() -> Self {
        Self::of(AttributeKind::Uuid)
    }

    pub fn posix_path() -> Self {
        Self::of(AttributeKind::PosixPath)
    }

    pub fn host_name() -> Self {
        Self::of(AttributeKind::HostName)
    }

    /// Mark the attribute as not mandatory
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Human readable label for presentation layers
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Restrict an integer attribute to an inclusive range
    pub fn range(mut self, lo: Option<i64>, hi: Option<i64>) -> Self {
        if let AttributeKind::Integer { min, max } = &mut self.kind {
            *min = lo;
            *max = hi;
        }
        self
    }

    /// Restrict a string attribute to a maximum length
    pub fn max_length(mut self, len: usize) -> Self {
        if let AttributeKind::String { max_length } = &mut self.kind {
            *max_length = Some(len);
        }
        self
    }

    /// Check that `value` lies in this attribute's domain
    pub fn validate(&self, name: &str, value: &AttributeValue) -> Result<()> {
        let fail = |reason: String| Error::Validation {
            attribute: name.to_string(),
            reason,
        };
        let mismatch = |expected: &str| {
            fail(format!(
                "expected {}, got {} ({})",
                expected,
                value.type_name(),
                value
            ))
        };

        match &self.kind {
            AttributeKind::String { max_length } => {
                let s = value.as_str().ok_or_else(|| mismatch("string"))?;
                if let Some(max) = max_length {
                    if s.chars().count() > *max {
                        return Err(fail(format!("longer than {} characters", max)));
                    }
                }
            }
            AttributeKind::Integer { min, max } => {
                let i = value.as_i64().ok_or_else(|| mismatch("integer"))?;
                if let Some(lo) = min {
                    if i < *lo {
                        return Err(fail(format!("{} is below minimum {}", i, lo)));
                    }
                }
                if let Some(hi) = max {
                    if i > *hi {
                        return Err(fail(format!("{} is above maximum {}", i, hi)));
                    }
                }
            }
            AttributeKind::Boolean => {
                value.as_bool().ok_or_else(|| mismatch("bool"))?;
            }
            AttributeKind::Float => {
                let f = value.as_f64().ok_or_else(|| mismatch("number"))?;
                if !f.is_finite() {
                    return Err(fail("not a finite number".into()));
                }
            }
            AttributeKind::Enum { options } => {
                let s = value.as_str().ok_or_else(|| mismatch("string"))?;
                if !options.iter().any(|o| o == s) {
                    return Err(fail(format!("{} is not one of {:?}", s, options)));
                }
            }
            AttributeKind::Bytes => {
                let i = value.as_i64().ok_or_else(|| mismatch("integer"))?;
                if i < 0 {
                    return Err(fail("byte count cannot be negative".into()));
                }
            }
            AttributeKind::Uuid => {
                let s = value.as_str().ok_or_else(|| mismatch("string"))?;
                if !is_uuid(s) {
                    return Err(fail(format!("{} is not a UUID", s)));
                }
            }
            AttributeKind::PosixPath => {
                let s = value.as_str().ok_or_else(|| mismatch("string"))?;
                if !s.starts_with('/') || s.contains('\0') {
                    return Err(fail(format!("{} is not an absolute path", s)));
                }
            }
            AttributeKind::HostName => {
                let s = value.as_str().ok_or_else(|| mismatch("string"))?;
                if !is_host_name(s) {
                    return Err(fail(format!("{} is not a valid hostname", s)));
                }
            }
        }
        Ok(())
    }

    /// Render a value for display
    pub fn human_readable(&self, value: &AttributeValue) -> String {
        match (&self.kind, value) {
            (AttributeKind::Bytes, AttributeValue::Integer(n)) => format_bytes(*n as u64),
            _ => value.to_string(),
        }
    }
}

fn is_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_host_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", n, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
