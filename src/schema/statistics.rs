//! Resource Statistics
//!
//! Time-series declarations attached to resource types. Plugins push samples
//! through the scan context; the latest sample per statistic is flushed with
//! the scan transaction.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Shape of a statistic's time series
#[derive(Debug, Clone, PartialEq)]
pub enum StatisticKind {
    /// Numerical series which can go up or down
    Gauge,
    /// Monotonically increasing series
    Counter,
    /// Fixed-length integer array; each bin is `(low, Some(high))` or
    /// `(low, None)` for "this value or higher"
    BytesHistogram { bins: Vec<(u64, Option<u64>)> },
}

/// A single statistic sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatisticValue {
    Scalar(f64),
    Histogram(Vec<u64>),
}

/// Schema entry for a statistic
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticDef {
    pub kind: StatisticKind,
    pub units: Option<String>,
}

impl StatisticDef {
    pub fn gauge() -> Self {
        Self {
            kind: StatisticKind::Gauge,
            units: None,
        }
    }

    pub fn counter() -> Self {
        Self {
            kind: StatisticKind::Counter,
            units: None,
        }
    }

    pub fn bytes_histogram(bins: Vec<(u64, Option<u64>)>) -> Self {
        Self {
            kind: StatisticKind::BytesHistogram { bins },
            units: Some("bytes".into()),
        }
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Check that a sample fits this statistic
    pub fn validate(&self, name: &str, value: &StatisticValue) -> Result<()> {
        let fail = |reason: String| Error::Validation {
            attribute: name.to_string(),
            reason,
        };
        match (&self.kind, value) {
            (StatisticKind::Gauge, StatisticValue::Scalar(v)) if v.is_finite() => Ok(()),
            (StatisticKind::Counter, StatisticValue::Scalar(v)) if v.is_finite() && *v >= 0.0 => {
                Ok(())
            }
            (StatisticKind::Counter, StatisticValue::Scalar(v)) => {
                Err(fail(format!("counter sample {} must be non-negative", v)))
            }
            (StatisticKind::BytesHistogram { bins }, StatisticValue::Histogram(values)) => {
                if values.len() == bins.len() {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "histogram has {} bins, expected {}",
                        values.len(),
                        bins.len()
                    )))
                }
            }
            (kind, value) => Err(fail(format!("{:?} does not fit {:?}", value, kind))),
        }
    }
}
