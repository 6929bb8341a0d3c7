//! Event types for the EAS station event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Health state of a single audio source adapter.
///
/// Exactly one state at a time; transitions are driven by the adapter's
/// producer and watchdog tasks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    /// No subprocess, no producer task. Initial state.
    Stopped,
    /// Subprocess spawned; waiting for the first successful read.
    Starting,
    /// Producing samples; watchdog satisfied; non-silent within window.
    Healthy,
    /// Producing, but overrunning, transiently quiet, or below nominal rate.
    Degraded,
    /// No liveness evidence or subprocess lost; restart pending.
    Failed,
    /// Restart attempts exhausted; terminal until externally reset.
    GivingUp,
}

impl SourceHealth {
    /// True when the failover selection rule may pick this source.
    pub fn is_serving(self) -> bool {
        matches!(self, SourceHealth::Healthy | SourceHealth::Degraded)
    }

    /// Stable discriminant for lock-free storage in an `AtomicU8`.
    pub fn index(self) -> u8 {
        match self {
            SourceHealth::Stopped => 0,
            SourceHealth::Starting => 1,
            SourceHealth::Healthy => 2,
            SourceHealth::Degraded => 3,
            SourceHealth::Failed => 4,
            SourceHealth::GivingUp => 5,
        }
    }

    /// Inverse of [`SourceHealth::index`].
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(SourceHealth::Stopped),
            1 => Some(SourceHealth::Starting),
            2 => Some(SourceHealth::Healthy),
            3 => Some(SourceHealth::Degraded),
            4 => Some(SourceHealth::Failed),
            5 => Some(SourceHealth::GivingUp),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceHealth::Stopped => write!(f, "stopped"),
            SourceHealth::Starting => write!(f, "starting"),
            SourceHealth::Healthy => write!(f, "healthy"),
            SourceHealth::Degraded => write!(f, "degraded"),
            SourceHealth::Failed => write!(f, "failed"),
            SourceHealth::GivingUp => write!(f, "giving_up"),
        }
    }
}

/// Why the active source changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    /// First activation after the manager started.
    Initial,
    /// Subprocess exit, read error, or spawn failure on the active source.
    Crash,
    /// The active source stopped delivering samples.
    WatchdogTimeout,
    /// Sustained audio level below the silence threshold.
    Silence,
    /// A higher-priority source recovered and held healthy long enough.
    HigherPriorityRecovered,
    /// Administrative override or membership change.
    Manual,
}

impl std::fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverReason::Initial => write!(f, "initial"),
            FailoverReason::Crash => write!(f, "crash"),
            FailoverReason::WatchdogTimeout => write!(f, "watchdog_timeout"),
            FailoverReason::Silence => write!(f, "silence"),
            FailoverReason::HigherPriorityRecovered => write!(f, "higher_priority_recovered"),
            FailoverReason::Manual => write!(f, "manual"),
        }
    }
}

/// One cut-over of the active source. Immutable once recorded; appended to
/// the manager's bounded history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    /// Source that was active before the cut (None at initial activation).
    pub from: Option<String>,
    /// Source that is active after the cut (None when no source qualifies).
    pub to: Option<String>,
    /// Why the cut happened.
    pub reason: FailoverReason,
    /// Optional free-form detail ("gave up after 10 attempts", ...).
    pub note: Option<String>,
    /// When the cut was decided.
    pub timestamp: DateTime<Utc>,
}

/// EAS ingest event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// Ingest pipeline started
    PipelineStarted {
        timestamp: DateTime<Utc>,
    },

    /// Ingest pipeline stopped
    PipelineStopped {
        timestamp: DateTime<Utc>,
    },

    /// A source changed health state
    SourceHealthChanged {
        source: String,
        from: SourceHealth,
        to: SourceHealth,
        timestamp: DateTime<Utc>,
    },

    /// A source's decoder subprocess is being restarted
    SourceRestarted {
        source: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A source exhausted its restart attempts
    SourceGaveUp {
        source: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// The active source changed
    FailoverOccurred {
        event: FailoverEvent,
    },
}

impl IngestEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            IngestEvent::PipelineStarted { .. } => "PipelineStarted",
            IngestEvent::PipelineStopped { .. } => "PipelineStopped",
            IngestEvent::SourceHealthChanged { .. } => "SourceHealthChanged",
            IngestEvent::SourceRestarted { .. } => "SourceRestarted",
            IngestEvent::SourceGaveUp { .. } => "SourceGaveUp",
            IngestEvent::FailoverOccurred { .. } => "FailoverOccurred",
        }
    }
}

/// Broadcast event bus shared by the pipeline components.
///
/// Wraps a `tokio::sync::broadcast` channel; publishing with no subscribers
/// is not an error. Out-of-scope collaborators (web UI, alert poller)
/// observe the pipeline exclusively through subscriptions.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` undelivered events per
    /// subscriber before the oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Broadcast an event to all subscribers.
    pub fn publish(&self, event: IngestEvent) {
        // Ignore send errors (no receivers is OK)
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_index_round_trip() {
        for state in [
            SourceHealth::Stopped,
            SourceHealth::Starting,
            SourceHealth::Healthy,
            SourceHealth::Degraded,
            SourceHealth::Failed,
            SourceHealth::GivingUp,
        ] {
            assert_eq!(SourceHealth::from_index(state.index()), Some(state));
        }
        assert_eq!(SourceHealth::from_index(200), None);
    }

    #[test]
    fn test_serving_states() {
        assert!(SourceHealth::Healthy.is_serving());
        assert!(SourceHealth::Degraded.is_serving());
        assert!(!SourceHealth::Starting.is_serving());
        assert!(!SourceHealth::Failed.is_serving());
        assert!(!SourceHealth::GivingUp.is_serving());
        assert!(!SourceHealth::Stopped.is_serving());
    }

    #[test]
    fn test_failover_event_serialization() {
        let event = FailoverEvent {
            from: Some("primary".to_string()),
            to: Some("backup".to_string()),
            reason: FailoverReason::Silence,
            note: None,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"silence\""));

        let parsed: FailoverEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.from.as_deref(), Some("primary"));
        assert_eq!(parsed.reason, FailoverReason::Silence);
    }

    #[tokio::test]
    async fn test_event_bus_delivery() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(IngestEvent::PipelineStarted {
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "PipelineStarted");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.publish(IngestEvent::PipelineStopped {
            timestamp: Utc::now(),
        });
    }
}
