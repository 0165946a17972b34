//! Error types for the storage resource graph
//!
//! Provides structured error types for every engine component including
//! schema validation, identity resolution, the plugin runtime, the plugin
//! manager and the persistent store collaborator.

use std::time::Duration;
use thiserror::Error;

use crate::domain::ports::RecordId;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Schema Errors
    // =========================================================================
    #[error("Validation failed for attribute {attribute}: {reason}")]
    Validation { attribute: String, reason: String },

    #[error("Unknown attribute {attribute} for resource type {resource_type}")]
    UnknownAttribute {
        resource_type: String,
        attribute: String,
    },

    #[error("Missing mandatory attribute {attribute} on resource type {resource_type}")]
    MissingMandatoryAttribute {
        resource_type: String,
        attribute: String,
    },

    #[error("Unknown statistic {statistic} for resource type {resource_type}")]
    UnknownStatistic {
        resource_type: String,
        statistic: String,
    },

    #[error("Invalid schema for resource type {resource_type}: {reason}")]
    Schema {
        resource_type: String,
        reason: String,
    },

    // =========================================================================
    // Identity Errors
    // =========================================================================
    #[error("Resource not found: {resource_type} {id}")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Duplicate registration of {resource_type} {id_str}")]
    DuplicateRegistration {
        resource_type: String,
        id_str: String,
    },

    #[error("Ordering violation registering {resource_type}: {reason}")]
    OrderingViolation {
        resource_type: String,
        reason: String,
    },

    // =========================================================================
    // Plugin Runtime Errors
    // =========================================================================
    #[error("Plugin {plugin} is broken: {reason}")]
    PluginBroken { plugin: String, reason: String },

    #[error("Plugin {plugin} update failed: {reason}")]
    PluginUpdate { plugin: String, reason: String },

    #[error("Session {plugin} cannot {operation} while {state}")]
    InvalidSessionState {
        plugin: String,
        operation: String,
        state: String,
    },

    // =========================================================================
    // Manager Errors
    // =========================================================================
    #[error("Module error: {module} - {reason}")]
    Module { module: String, reason: String },

    #[error("Unknown resource class {class_name} in module {module}")]
    UnknownResourceClass { module: String, class_name: String },

    #[error("Session already active for plugin {plugin}")]
    SessionAlreadyActive { plugin: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store operation failed: {operation}: {reason}")]
    StoreOperation { operation: String, reason: String },

    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the scheduler takes when a scan returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry on the next periodic tick
    RetryAfter(Duration),
    /// Never schedule this session again
    Disable,
}

impl Error {
    /// Determine what the scheduler should do with this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient infrastructure errors
            Error::StoreUnavailable(_) | Error::StoreOperation { .. } | Error::Io(_) => {
                ErrorAction::RetryWithBackoff
            }

            // Plugin refresh failed, next tick starts from in-memory state
            Error::PluginUpdate { .. } | Error::Validation { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(60))
            }

            // Programming errors in the plugin or its module
            Error::PluginBroken { .. }
            | Error::DuplicateRegistration { .. }
            | Error::OrderingViolation { .. }
            | Error::Module { .. }
            | Error::Schema { .. }
            | Error::Configuration(_) => ErrorAction::Disable,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error permanently disables a session
    pub fn is_fatal(&self) -> bool {
        matches!(self.action(), ErrorAction::Disable)
    }

    /// Check if this error is an infrastructure hiccup
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::StoreOperation { .. } | Error::Io(_)
        )
    }

    pub(crate) fn store(operation: &str, reason: impl Into<String>) -> Self {
        Error::StoreOperation {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::PluginUpdate {
            plugin: "ArrayPlugin".into(),
            reason: "controller timeout".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RetryAfter(Duration::from_secs(60))
        );

        let err = Error::DuplicateRegistration {
            resource_type: "Disk".into(),
            id_str: "[3]".into(),
        };
        assert_eq!(err.action(), ErrorAction::Disable);

        let err = Error::StoreUnavailable("connection reset".into());
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);
    }

    #[test]
    fn test_error_fatal_and_transient() {
        let transient = Error::store("commit", "deadlock detected");
        assert!(!transient.is_fatal());
        assert!(transient.is_transient());

        let broken = Error::PluginBroken {
            plugin: "ArrayPlugin".into(),
            reason: "initial scan raised".into(),
        };
        assert!(broken.is_fatal());
        assert!(!broken.is_transient());

        let miss = Error::ResourceNotFound {
            resource_type: "Disk".into(),
            id: "[3]".into(),
        };
        assert!(!miss.is_fatal());
    }
}
