//! Passive health query surface
//!
//! A pure read model over the manager's shared state: per-source metrics,
//! master buffer accounting, and recent failover history gathered into one
//! snapshot. Only atomics are read and bounded copies taken; a snapshot is
//! internally consistent with some instant between construction and
//! return, so e.g. seeing source A active while A's metrics momentarily
//! read `Degraded` is normal, not an anomaly.

use crate::ingest::manager::ManagerShared;
use chrono::Utc;
use eas_common::metrics::HealthSnapshot;
use std::sync::Arc;

/// Default number of failover events included in a snapshot.
const SNAPSHOT_HISTORY_LIMIT: usize = 32;

/// Read-only health view over one [`crate::ingest::SourceManager`].
///
/// Cheap to clone; hand one to whatever surfaces operator state (CLI,
/// admin transport, periodic log line).
#[derive(Clone)]
pub struct HealthReporter {
    shared: Arc<ManagerShared>,
}

impl HealthReporter {
    pub(crate) fn new(shared: Arc<ManagerShared>) -> Self {
        Self { shared }
    }

    /// Aggregate the current pipeline state.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_with_history(SNAPSHOT_HISTORY_LIMIT)
    }

    /// Aggregate with an explicit failover-history limit.
    pub fn snapshot_with_history(&self, history_limit: usize) -> HealthSnapshot {
        HealthSnapshot {
            timestamp: Utc::now(),
            active_source: self.shared.active_name(),
            sources: self.shared.all_metrics_ordered(),
            master_buffer: self.shared.master_snapshot(),
            recent_failovers: self.shared.recent_history(history_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{IngestConfig, SourceConfig};
    use crate::ingest::SourceManager;

    fn config() -> IngestConfig {
        IngestConfig {
            sources: vec![
                SourceConfig {
                    name: "primary".to_string(),
                    uri: "http://radio.example/primary".to_string(),
                    priority: 10,
                    silence_threshold_dbfs: -50.0,
                    silence_duration_seconds: 10.0,
                    watchdog_timeout_seconds: 5.0,
                    max_restart_attempts: 10,
                    enabled: true,
                    decoder: "ffmpeg".to_string(),
                },
                SourceConfig {
                    name: "backup".to_string(),
                    uri: "http://radio.example/backup".to_string(),
                    priority: 20,
                    silence_threshold_dbfs: -50.0,
                    silence_duration_seconds: 10.0,
                    watchdog_timeout_seconds: 5.0,
                    max_restart_attempts: 10,
                    enabled: true,
                    decoder: "ffmpeg".to_string(),
                },
            ],
            ..IngestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_snapshot_reflects_configuration() {
        let manager = SourceManager::new(config()).unwrap();
        let reporter = manager.health_reporter();

        let snapshot = reporter.snapshot();
        assert!(snapshot.active_source.is_none());
        assert_eq!(snapshot.sources.len(), 2);
        // Configuration order preserved
        assert_eq!(snapshot.sources[0].name, "primary");
        assert_eq!(snapshot.sources[1].name, "backup");
        assert!(snapshot.recent_failovers.is_empty());
        assert!(snapshot.master_buffer.capacity > 0);

        // Serializable for any admin transport
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"primary\""));
    }

    #[tokio::test]
    async fn test_reporter_survives_membership_changes() {
        let manager = SourceManager::new(config()).unwrap();
        let reporter = manager.health_reporter();

        manager.remove_source("backup").await.unwrap();
        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.sources.len(), 1);
        assert_eq!(snapshot.sources[0].name, "primary");
    }
}
