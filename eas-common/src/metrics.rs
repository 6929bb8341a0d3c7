//! Read-model snapshot types for pipeline health reporting
//!
//! These are pure data: the ingest crate fills them from atomics and bounded
//! copies, the health surface serializes them for operators. Nothing here
//! performs I/O.

use crate::events::{FailoverEvent, SourceHealth};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Accounting snapshot of one ring buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferStats {
    /// Buffer capacity in samples (power of two).
    pub capacity: usize,
    /// Current fill in samples. Statistics-grade: may lag the true value.
    pub fill: usize,
    /// Samples refused because the buffer was full.
    pub overruns: u64,
    /// Samples requested that could not be served.
    pub underruns: u64,
    /// Maximum observed fill since creation.
    pub peak_fill: usize,
}

impl BufferStats {
    /// Fill as a fraction of capacity in `[0.0, 1.0]`.
    pub fn fill_fraction(&self) -> f32 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.fill.min(self.capacity)) as f32 / self.capacity as f32
        }
    }
}

/// Read-only snapshot of one source's health and throughput.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetrics {
    /// Source name (unique within the manager).
    pub name: String,
    /// Current health state.
    pub health: SourceHealth,
    /// Failover priority (lower = preferred).
    pub priority: i32,
    /// Whether the source participates in failover.
    pub enabled: bool,
    /// Seconds since the adapter was last started (0 when stopped).
    pub uptime_seconds: f64,
    /// Seconds of continuous `Healthy` (0 when not healthy).
    pub healthy_streak_seconds: f64,
    /// Samples per second observed over the recent window.
    pub samples_per_second: f32,
    /// Restart attempts in the current failure streak.
    pub restart_count: u32,
    /// Failures without an intervening healthy streak.
    pub consecutive_failures: u32,
    /// Ring buffer fill as a fraction in `[0.0, 1.0]`.
    pub buffer_fill: f32,
    /// Ring buffer overrun count since start.
    pub overruns: u64,
    /// Ring buffer underrun count since start.
    pub underruns: u64,
    /// Windowed peak level in dBFS.
    pub peak_dbfs: f32,
    /// Windowed RMS level in dBFS.
    pub rms_dbfs: f32,
    /// Most recent error excerpt, if any.
    pub last_error: Option<String>,
}

/// Aggregated health snapshot: every source, the master buffer, and the
/// recent failover history, internally consistent with some instant between
/// construction and return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Name of the currently active source, if any.
    pub active_source: Option<String>,
    /// Per-source metrics in configuration order.
    pub sources: Vec<SourceMetrics>,
    /// Master buffer accounting.
    pub master_buffer: BufferStats,
    /// Most recent failover events, oldest first.
    pub recent_failovers: Vec<FailoverEvent>,
}
