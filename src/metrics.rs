//! Engine Metrics
//!
//! Lock-free counters updated by plugin sessions and the manager, read
//! through point-in-time snapshots.

use crate::plugin::ScanKind;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every session of one manager
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Initial scans started
    pub initial_scans: AtomicU64,
    /// Periodic updates started
    pub update_scans: AtomicU64,
    /// Scans that did not commit
    pub scan_failures: AtomicU64,
    /// Records created by flushes or root creation
    pub resources_created: AtomicU64,
    /// Records culled
    pub resources_culled: AtomicU64,
    pub alerts_raised: AtomicU64,
    pub alerts_cleared: AtomicU64,
    /// Plugins whose initial scan failed
    pub plugins_broken: AtomicU64,
    /// Sessions currently registered
    pub active_sessions: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_scan(&self, kind: ScanKind) {
        match kind {
            ScanKind::Initial => self.initial_scans.fetch_add(1, Ordering::Relaxed),
            ScanKind::Update => self.update_scans.fetch_add(1, Ordering::Relaxed),
        };
        self.touch();
    }

    #[inline]
    pub fn record_scan_failure(&self) {
        self.scan_failures.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_created(&self, count: u64) {
        self.resources_created.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_culled(&self, count: u64) {
        self.resources_culled.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert(&self, active: bool) {
        if active {
            self.alerts_raised.fetch_add(1, Ordering::Relaxed);
        } else {
            self.alerts_cleared.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_plugin_broken(&self) {
        self.plugins_broken.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_stopped(&self) {
        // Saturating decrement
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            initial_scans: self.initial_scans.load(Ordering::Relaxed),
            update_scans: self.update_scans.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
            resources_created: self.resources_created.load(Ordering::Relaxed),
            resources_culled: self.resources_culled.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            alerts_cleared: self.alerts_cleared.load(Ordering::Relaxed),
            plugins_broken: self.plugins_broken.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of engine metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub initial_scans: u64,
    pub update_scans: u64,
    pub scan_failures: u64,
    pub resources_created: u64,
    pub resources_culled: u64,
    pub alerts_raised: u64,
    pub alerts_cleared: u64,
    pub plugins_broken: u64,
    pub active_sessions: u64,
}

impl MetricsSnapshot {
    pub fn total_scans(&self) -> u64 {
        self.initial_scans + self.update_scans
    }

    /// Fraction of scans that committed (1.0 when nothing ran yet)
    pub fn success_ratio(&self) -> f64 {
        let total = self.total_scans();
        if total == 0 {
            1.0
        } else {
            (total - self.scan_failures.min(total)) as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = EngineMetrics::new();
        metrics.record_scan(ScanKind::Initial);
        metrics.record_scan(ScanKind::Update);
        metrics.record_scan(ScanKind::Update);
        metrics.record_scan_failure();
        metrics.record_alert(true);
        metrics.record_alert(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_scans(), 3);
        assert_eq!(snapshot.alerts_raised, 1);
        assert_eq!(snapshot.alerts_cleared, 1);
        assert!((snapshot.success_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_session_gauge_never_wraps() {
        let metrics = EngineMetrics::new();
        metrics.record_session_stopped();
        assert_eq!(metrics.snapshot().active_sessions, 0);
        metrics.record_session_started();
        assert_eq!(metrics.snapshot().active_sessions, 1);
    }
}
