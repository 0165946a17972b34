//! Plugin Sessions
//!
//! A session owns one plugin instance and its cache, and drives it through
//! the scan lifecycle:
//!
//! ```text
//! Uninitialized ──► InitialScanRunning ──► Idle ◄──► PeriodicUpdateRunning
//!                          │                 │
//!                          ▼                 ▼
//!                        Broken           Stopped
//! ```
//!
//! Every scan runs inside a single store transaction. The plugin reports
//! into the cache, the flush writes the deltas, and only a successful
//! commit marks the cache clean.

use crate::domain::ports::StoragePlugin;
use crate::error::{Error, Result};
use crate::graph::ResourceHandle;
use crate::manager::{LoadedModule, PluginManager};
use crate::plugin::cache::SessionCache;
use crate::plugin::context::ScanContext;
use crate::plugin::events::{ScanKind, SessionEvent};
use crate::plugin::flush::{self, FlushOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a plugin session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    InitialScanRunning,
    Idle,
    PeriodicUpdateRunning,
    Broken,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Broken | SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::InitialScanRunning => "running initial scan",
            SessionState::Idle => "idle",
            SessionState::PeriodicUpdateRunning => "running periodic update",
            SessionState::Broken => "broken",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Summary of one committed scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub persisted: usize,
    pub created: usize,
    pub culled: usize,
    pub alerts: usize,
    pub skipped: usize,
}

// =============================================================================
// Plugin Session
// =============================================================================

/// One running instance of a plugin type
pub struct PluginSession {
    manager: Arc<PluginManager>,
    module: Arc<LoadedModule>,
    plugin: Box<dyn StoragePlugin>,
    cache: SessionCache,
    state: SessionState,
    session_id: u64,
    registered: bool,
}

impl PluginSession {
    /// Created by [`PluginManager::create_session`], which registers it
    pub(crate) fn new(
        manager: Arc<PluginManager>,
        module: Arc<LoadedModule>,
        session_id: u64,
    ) -> Self {
        let plugin = module.plugin().instantiate();
        Self {
            manager,
            module,
            plugin,
            cache: SessionCache::new(),
            state: SessionState::Uninitialized,
            session_id,
            registered: true,
        }
    }

    pub fn plugin_name(&self) -> &str {
        self.module.plugin().name()
    }

    pub fn module(&self) -> &Arc<LoadedModule> {
        &self.module
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Handles of every cached resource
    pub fn resources(&self) -> Vec<ResourceHandle> {
        self.cache.handles()
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Run the plugin's discovery routine once and persist what it found
    ///
    /// A plugin error breaks the session for good. A store error discards
    /// the scan so that it can be attempted again.
    pub fn initial_scan(&mut self) -> Result<ScanReport> {
        self.expect_state(SessionState::Uninitialized, "run initial scan")?;
        self.state = SessionState::InitialScanRunning;
        info!(plugin = %self.plugin_name(), session = self.session_id, "Starting initial scan");

        match self.run_scan(ScanKind::Initial) {
            Ok(report) => {
                self.state = SessionState::Idle;
                Ok(report)
            }
            Err(e @ Error::PluginBroken { .. }) => {
                error!(plugin = %self.plugin_name(), error = %e, "Plugin broken");
                self.state = SessionState::Broken;
                self.manager.metrics().record_plugin_broken();
                self.manager.emit(SessionEvent::PluginBroken {
                    plugin: self.plugin_name().to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
            Err(e) => {
                warn!(plugin = %self.plugin_name(), error = %e, "Initial scan not persisted");
                self.cache = SessionCache::new();
                self.state = SessionState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Run the plugin's refresh routine and persist the deltas
    ///
    /// On failure the session returns to idle; whatever the plugin changed
    /// in the cache stays dirty for the next attempt.
    pub fn update_scan(&mut self) -> Result<ScanReport> {
        self.expect_state(SessionState::Idle, "run periodic update")?;
        self.state = SessionState::PeriodicUpdateRunning;
        debug!(plugin = %self.plugin_name(), session = self.session_id, "Starting periodic update");

        let result = self.run_scan(ScanKind::Update);
        self.state = SessionState::Idle;
        if let Err(e) = &result {
            warn!(plugin = %self.plugin_name(), error = %e, "Periodic update failed");
        }
        result
    }

    fn run_scan(&mut self, kind: ScanKind) -> Result<ScanReport> {
        let metrics = self.manager.metrics().clone();
        metrics.record_scan(kind);

        let result = self.scan_and_flush(kind);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics.record_scan_failure();
                return Err(e);
            }
        };

        flush::apply(&mut self.cache, &outcome);
        let report = self.publish(kind, &outcome);
        info!(
            plugin = %self.plugin_name(),
            %kind,
            persisted = report.persisted,
            created = report.created,
            culled = report.culled,
            alerts = report.alerts,
            "Scan committed"
        );
        Ok(report)
    }

    /// Plugin scan, flush and commit in one transaction
    fn scan_and_flush(&mut self, kind: ScanKind) -> Result<FlushOutcome> {
        let plugin_name = self.module.plugin().name().to_string();
        let mut tx = self.manager.store().begin()?;

        let scanned = {
            let ctx = ScanContext::new(&self.module, &self.manager, &mut self.cache, &mut *tx);
            match kind {
                ScanKind::Initial => self.plugin.initial_scan(&ctx),
                ScanKind::Update => self.plugin.update_scan(&ctx),
            }
        };

        if let Err(e) = scanned {
            let reason = format!("{:#}", e);
            return Err(match kind {
                ScanKind::Initial => Error::PluginBroken {
                    plugin: plugin_name,
                    reason,
                },
                ScanKind::Update => Error::PluginUpdate {
                    plugin: plugin_name,
                    reason,
                },
            });
        }

        let outcome = flush::flush(&mut self.cache, &mut *tx, &self.manager, kind)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn publish(&self, kind: ScanKind, outcome: &FlushOutcome) -> ScanReport {
        let plugin = self.plugin_name().to_string();
        let metrics = self.manager.metrics();

        for (record_id, resource_type) in &outcome.created {
            self.manager.emit(SessionEvent::ResourceCreated {
                plugin: plugin.clone(),
                record_id: record_id.0,
                resource_type: resource_type.clone(),
            });
        }
        for record_id in &outcome.culled {
            self.manager.emit(SessionEvent::ResourceCulled {
                plugin: plugin.clone(),
                record_id: record_id.0,
            });
        }
        for (key, record_id, active) in &outcome.alerts_sent {
            metrics.record_alert(*active);
            let event = if *active {
                SessionEvent::AlertRaised {
                    plugin: plugin.clone(),
                    record_id: record_id.0,
                    condition: key.condition.clone(),
                    attribute: key.attribute.clone(),
                }
            } else {
                SessionEvent::AlertCleared {
                    plugin: plugin.clone(),
                    record_id: record_id.0,
                    condition: key.condition.clone(),
                    attribute: key.attribute.clone(),
                }
            };
            self.manager.emit(event);
        }
        metrics.record_created(outcome.created.len() as u64);
        metrics.record_culled(outcome.culled.len() as u64);

        self.manager.emit(SessionEvent::ScanCompleted {
            plugin,
            kind,
            persisted: outcome.persisted.len(),
            culled: outcome.culled.len(),
        });

        ScanReport {
            persisted: outcome.persisted.len(),
            created: outcome.created.len(),
            culled: outcome.culled.len(),
            alerts: outcome.alerts_sent.len(),
            skipped: outcome.skipped,
        }
    }

    /// Stop the session and release its registration
    pub fn stop(&mut self) {
        if self.state != SessionState::Broken {
            self.state = SessionState::Stopped;
        }
        self.unregister();
    }

    fn unregister(&mut self) {
        if self.registered {
            self.registered = false;
            self.manager.unregister_session(self.plugin_name());
        }
    }

    fn expect_state(&self, expected: SessionState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidSessionState {
                plugin: self.plugin_name().to_string(),
                operation: operation.to_string(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSession")
            .field("plugin", &self.plugin_name())
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("resources", &self.cache.len())
            .finish()
    }
}
