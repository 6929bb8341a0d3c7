//! Canonical tuning defaults for the ingest pipeline
//!
//! Every value here can be overridden per deployment (pipeline section of
//! the TOML config) or per source (source table entries). The constants are
//! the single source of truth; serde default functions in the config layer
//! and test fixtures both read from here.

use std::time::Duration;

/// Pipeline sample rate in Hz. All sources are transcoded to this rate by
/// the decoder subprocess before they enter the pipeline.
pub const SAMPLE_RATE: u32 = 22_050;

/// Per-source ring buffer duration in seconds.
pub const SOURCE_BUFFER_SECONDS: f64 = 10.0;

/// Master (output) buffer duration in seconds.
pub const MASTER_BUFFER_SECONDS: f64 = 5.0;

/// Seconds without any decoded samples before a source is declared dead.
pub const WATCHDOG_TIMEOUT_SECONDS: f64 = 5.0;

/// Windowed peak below this level (dBFS) counts as silence.
pub const SILENCE_THRESHOLD_DBFS: f32 = -50.0;

/// Sustained silence of this many seconds fails the source.
pub const SILENCE_DURATION_SECONDS: f64 = 10.0;

/// Consecutive restart attempts before a source parks in `GivingUp`.
pub const MAX_RESTART_ATTEMPTS: u32 = 10;

/// Exponential restart backoff schedule in seconds. Attempts beyond the end
/// of the table stay at the final value.
pub const RESTART_BACKOFF_SECONDS: [f64; 7] = [0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// Continuous `Healthy` time after which the restart counter resets to zero.
pub const HEALTHY_RESET_SECONDS: f64 = 60.0;

/// Minimum `Healthy` time before a higher-priority source may preempt the
/// active one. Prevents flapping between a marginal primary and its backup.
pub const PREEMPT_HYSTERESIS_SECONDS: f64 = 5.0;

/// Bounded failover history length (oldest entries overwritten).
pub const FAILOVER_HISTORY_CAPACITY: usize = 256;

/// Failover loop cadence in milliseconds. Also the watchdog cadence and the
/// upper bound on failover reaction latency per iteration.
pub const FAILOVER_TICK_MS: u64 = 100;

/// A `Degraded` active source producing zero samples for this long triggers
/// re-selection.
pub const STALL_WINDOW_MS: u64 = 500;

/// Grace window between asking a decoder subprocess to wind down and
/// force-killing it.
pub const STOP_GRACE_SECONDS: f64 = 2.0;

/// Budget for an adapter's tasks to observe a stop request. A task still
/// running past this is logged as stuck.
pub const TASK_STOP_BUDGET_SECONDS: f64 = 1.0;

/// Observed sample rate below this fraction of nominal marks the source
/// `Degraded`.
pub const MIN_RATE_FRACTION: f64 = 0.5;

/// External decoder binary. Anything that accepts the ffmpeg-style
/// directive set (s16le, mono, target rate, stdout) works here.
pub const DECODER_BINARY: &str = "ffmpeg";

/// dBFS value reported for digital silence (peak amplitude of exactly zero).
pub const SILENCE_FLOOR_DBFS: f32 = -120.0;

/// Restart delay for the given attempt number (0-based index into the
/// backoff schedule; attempts past the table saturate at the final entry).
pub fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(RESTART_BACKOFF_SECONDS.len() - 1);
    Duration::from_secs_f64(RESTART_BACKOFF_SECONDS[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_shape() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        // Saturates at the 60 s floor
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let mut prev = Duration::ZERO;
        for attempt in 0..10 {
            let d = backoff_delay(attempt);
            assert!(d >= prev, "backoff must never shrink");
            prev = d;
        }
    }
}
