//! Session Events
//!
//! Events emitted by plugin sessions for external consumers to react to
//! graph changes.

use serde::{Deserialize, Serialize};

/// Which scan produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    Initial,
    Update,
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanKind::Initial => write!(f, "initial"),
            ScanKind::Update => write!(f, "update"),
        }
    }
}

/// Events emitted by plugin sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A session was registered with the manager
    SessionRegistered { plugin: String },

    /// A session was stopped or dropped
    SessionUnregistered { plugin: String },

    /// A resource record was created in the store
    ResourceCreated {
        plugin: String,
        record_id: u64,
        resource_type: String,
    },

    /// A resource record was culled from the store
    ResourceCulled { plugin: String, record_id: u64 },

    /// An alert transitioned to active
    AlertRaised {
        plugin: String,
        record_id: u64,
        condition: String,
        attribute: Option<String>,
    },

    /// An alert transitioned to inactive
    AlertCleared {
        plugin: String,
        record_id: u64,
        condition: String,
        attribute: Option<String>,
    },

    /// A scan committed
    ScanCompleted {
        plugin: String,
        kind: ScanKind,
        persisted: usize,
        culled: usize,
    },

    /// The initial scan failed and the session is dead
    PluginBroken { plugin: String, reason: String },
}

impl SessionEvent {
    /// Get the plugin associated with this event
    pub fn plugin(&self) -> &str {
        match self {
            SessionEvent::SessionRegistered { plugin }
            | SessionEvent::SessionUnregistered { plugin }
            | SessionEvent::ResourceCreated { plugin, .. }
            | SessionEvent::ResourceCulled { plugin, .. }
            | SessionEvent::AlertRaised { plugin, .. }
            | SessionEvent::AlertCleared { plugin, .. }
            | SessionEvent::ScanCompleted { plugin, .. }
            | SessionEvent::PluginBroken { plugin, .. } => plugin,
        }
    }

    /// Check if this is an alert transition
    pub fn is_alert_event(&self) -> bool {
        matches!(
            self,
            SessionEvent::AlertRaised { .. } | SessionEvent::AlertCleared { .. }
        )
    }

    /// Get the record ID if this event concerns a single record
    pub fn record_id(&self) -> Option<u64> {
        match self {
            SessionEvent::ResourceCreated { record_id, .. }
            | SessionEvent::ResourceCulled { record_id, .. }
            | SessionEvent::AlertRaised { record_id, .. }
            | SessionEvent::AlertCleared { record_id, .. } => Some(*record_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = SessionEvent::AlertRaised {
            plugin: "ArrayPlugin".to_string(),
            record_id: 7,
            condition: "too_hot".to_string(),
            attribute: Some("temperature".to_string()),
        };
        assert_eq!(event.plugin(), "ArrayPlugin");
        assert_eq!(event.record_id(), Some(7));
        assert!(event.is_alert_event());

        let event = SessionEvent::ScanCompleted {
            plugin: "ArrayPlugin".to_string(),
            kind: ScanKind::Initial,
            persisted: 3,
            culled: 0,
        };
        assert_eq!(event.record_id(), None);
        assert!(!event.is_alert_event());
    }
}
