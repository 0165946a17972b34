//! Session Scheduler
//!
//! Drives plugin sessions on the tokio runtime. Scans are blocking calls,
//! so each one runs on the blocking pool with the session moved in and
//! handed back when the scan returns; a session therefore never runs two
//! scans at once.
//!
//! Initial scans that fail on transient store errors are retried with
//! exponential backoff. A plugin whose initial scan raises is broken and
//! never scheduled again. Periodic update failures are logged and the next
//! tick retries from the session's in-memory state.

use crate::error::{Error, Result};
use crate::manager::PluginManager;
use crate::plugin::{PluginSession, ScanReport};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between periodic updates of one session
    pub update_interval: Duration,
    /// First delay before retrying a failed initial scan
    pub initial_retry_interval: Duration,
    /// Upper bound of the retry delay
    pub initial_retry_max_interval: Duration,
    /// Give up retrying the initial scan after this long (`None` retries forever)
    pub initial_retry_max_elapsed: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(10),
            initial_retry_interval: Duration::from_millis(500),
            initial_retry_max_interval: Duration::from_secs(30),
            initial_retry_max_elapsed: Some(Duration::from_secs(300)),
        }
    }
}

impl SchedulerConfig {
    fn initial_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_retry_interval,
            current_interval: self.initial_retry_interval,
            max_interval: self.initial_retry_max_interval,
            max_elapsed_time: self.initial_retry_max_elapsed,
            ..ExponentialBackoff::default()
        }
    }
}

/// How a scheduled session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Shut down on request
    Stopped,
    /// The initial scan raised; the plugin is excluded from scheduling
    Broken(String),
    /// Gave up on the session for any other reason
    Failed(String),
}

// =============================================================================
// Scheduler
// =============================================================================

/// Runs one task per plugin session
pub struct Scheduler {
    manager: Arc<PluginManager>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<SessionExit>)>>,
}

impl Scheduler {
    pub fn new(manager: Arc<PluginManager>, config: SchedulerConfig) -> Self {
        Self {
            manager,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a session for `module` and schedule it
    pub fn spawn(&self, module: &str) -> Result<()> {
        let session = self.manager.create_session(module)?;
        let plugin = session.plugin_name().to_string();
        let config = self.config.clone();
        let cancel = self.cancel.child_token();

        info!(%plugin, %module, "Scheduling session");
        let handle = tokio::spawn(run_session(session, config, cancel));
        self.tasks.lock().push((plugin, handle));
        Ok(())
    }

    /// Ask every session to stop after its current scan
    pub fn shutdown(&self) {
        info!("Stopping scheduled sessions");
        self.cancel.cancel();
    }

    /// Wait for every scheduled session to end
    pub async fn join(&self) -> Vec<(String, SessionExit)> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut exits = Vec::with_capacity(tasks.len());
        for (plugin, handle) in tasks {
            let exit = handle
                .await
                .unwrap_or_else(|e| SessionExit::Failed(format!("session task failed: {}", e)));
            exits.push((plugin, exit));
        }
        exits
    }
}

/// Run one blocking scan with the session moved onto the blocking pool
async fn run_blocking(
    mut session: PluginSession,
    scan: fn(&mut PluginSession) -> Result<ScanReport>,
) -> std::result::Result<(PluginSession, Result<ScanReport>), SessionExit> {
    tokio::task::spawn_blocking(move || {
        let result = scan(&mut session);
        (session, result)
    })
    .await
    .map_err(|e| SessionExit::Failed(format!("scan task failed: {}", e)))
}

async fn run_session(
    session: PluginSession,
    config: SchedulerConfig,
    cancel: CancellationToken,
) -> SessionExit {
    let plugin = session.plugin_name().to_string();

    let session = match initial_scan(session, &config, &cancel).await {
        Ok(session) => session,
        Err(exit) => {
            debug!(%plugin, ?exit, "Session ended before its first update");
            return exit;
        }
    };
    periodic_updates(session, &config, &cancel).await
}

async fn initial_scan(
    mut session: PluginSession,
    config: &SchedulerConfig,
    cancel: &CancellationToken,
) -> std::result::Result<PluginSession, SessionExit> {
    let mut backoff = config.initial_backoff();
    loop {
        let (returned, result) = run_blocking(session, PluginSession::initial_scan).await?;
        session = returned;

        let error = match result {
            Ok(report) => {
                info!(
                    plugin = %session.plugin_name(),
                    persisted = report.persisted,
                    culled = report.culled,
                    "Initial scan complete"
                );
                return Ok(session);
            }
            Err(error) => error,
        };

        if let Error::PluginBroken { reason, .. } = &error {
            return Err(SessionExit::Broken(reason.clone()));
        }
        if !error.is_transient() {
            error!(plugin = %session.plugin_name(), %error, "Initial scan failed");
            return Err(SessionExit::Failed(error.to_string()));
        }
        let Some(delay) = backoff.next_backoff() else {
            error!(plugin = %session.plugin_name(), %error, "Giving up on initial scan");
            return Err(SessionExit::Failed(error.to_string()));
        };

        warn!(
            plugin = %session.plugin_name(),
            %error,
            retry_in_ms = delay.as_millis() as u64,
            "Initial scan failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                session.stop();
                return Err(SessionExit::Stopped);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn periodic_updates(
    mut session: PluginSession,
    config: &SchedulerConfig,
    cancel: &CancellationToken,
) -> SessionExit {
    let mut ticker = tokio::time::interval(config.update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (returned, result) = match run_blocking(session, PluginSession::update_scan).await {
                    Ok(pair) => pair,
                    Err(exit) => return exit,
                };
                session = returned;

                match result {
                    Ok(report) => debug!(
                        plugin = %session.plugin_name(),
                        persisted = report.persisted,
                        culled = report.culled,
                        alerts = report.alerts,
                        "Periodic update complete"
                    ),
                    Err(e) if e.is_fatal() => {
                        error!(plugin = %session.plugin_name(), error = %e, "Disabling session");
                        session.stop();
                        return SessionExit::Failed(e.to_string());
                    }
                    Err(e) => warn!(
                        plugin = %session.plugin_name(),
                        error = %e,
                        action = ?e.action(),
                        "Periodic update failed"
                    ),
                }
            }
        }
    }

    session.stop();
    info!(plugin = %session.plugin_name(), "Session stopped");
    SessionExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::testing::{self, ScriptedPlugin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            update_interval: Duration::from_millis(10),
            initial_retry_interval: Duration::from_millis(5),
            initial_retry_max_interval: Duration::from_millis(20),
            initial_retry_max_elapsed: Some(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn test_periodic_updates_until_shutdown() {
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let plugin = move || {
            let counter = counter.clone();
            ScriptedPlugin::default().on_update(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let (manager, _store) = testing::manager_with_plugin(plugin);

        let scheduler = Scheduler::new(manager.clone(), fast_config());
        scheduler.spawn("array").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown();

        let exits = scheduler.join().await;
        assert_eq!(exits, vec![(testing::ARRAY_PLUGIN.to_string(), SessionExit::Stopped)]);
        assert!(updates.load(Ordering::SeqCst) > 0);
        assert!(manager.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_broken_plugin_is_not_rescheduled() {
        let (manager, _store) = testing::manager_with_plugin(|| {
            ScriptedPlugin::default().on_initial(|_ctx| anyhow::bail!("controller unreachable"))
        });

        let scheduler = Scheduler::new(manager.clone(), fast_config());
        scheduler.spawn("array").unwrap();
        let exits = scheduler.join().await;

        assert_eq!(exits.len(), 1);
        assert!(matches!(&exits[0].1, SessionExit::Broken(reason) if reason.contains("controller unreachable")));
        assert!(manager.active_sessions().is_empty());
        assert_eq!(manager.metrics().snapshot().plugins_broken, 1);
    }

    #[tokio::test]
    async fn test_initial_scan_retried_on_transient_store_failure() {
        let (manager, store) = testing::manager_with_plugin(testing::array_plugin);
        store.set_available(false);

        let scheduler = Scheduler::new(manager.clone(), fast_config());
        scheduler.spawn("array").unwrap();

        let reviver = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            reviver.set_available(true);
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown();
        let exits = scheduler.join().await;

        assert_eq!(exits[0].1, SessionExit::Stopped);
        assert!(store.find_record("array", "Array", r#"["A1"]"#).is_some());
        assert!(manager.metrics().snapshot().scan_failures >= 1);
    }

    #[tokio::test]
    async fn test_unknown_module_is_rejected() {
        let manager = PluginManager::new(Arc::new(InMemoryStore::new()));
        let scheduler = Scheduler::new(manager, fast_config());
        assert!(scheduler.spawn("missing").is_err());
        assert!(scheduler.join().await.is_empty());
    }
}
