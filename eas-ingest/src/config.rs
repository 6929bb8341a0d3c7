//! Configuration loading and management
//!
//! Loads the pipeline configuration from a TOML file; the caller supplies
//! everything, nothing is persisted by the core. Every tunable defaults to
//! the canonical value in `eas_common::defaults` and can be overridden per
//! deployment or per source.

use crate::error::{Error, Result};
use eas_common::defaults;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_sample_rate() -> u32 {
    defaults::SAMPLE_RATE
}

fn default_source_buffer_seconds() -> f64 {
    defaults::SOURCE_BUFFER_SECONDS
}

fn default_master_buffer_seconds() -> f64 {
    defaults::MASTER_BUFFER_SECONDS
}

fn default_watchdog_timeout_seconds() -> f64 {
    defaults::WATCHDOG_TIMEOUT_SECONDS
}

fn default_silence_threshold_dbfs() -> f32 {
    defaults::SILENCE_THRESHOLD_DBFS
}

fn default_silence_duration_seconds() -> f64 {
    defaults::SILENCE_DURATION_SECONDS
}

fn default_max_restart_attempts() -> u32 {
    defaults::MAX_RESTART_ATTEMPTS
}

fn default_enabled() -> bool {
    true
}

fn default_decoder() -> String {
    defaults::DECODER_BINARY.to_string()
}

fn default_tick_ms() -> u64 {
    defaults::FAILOVER_TICK_MS
}

fn default_stall_window_ms() -> u64 {
    defaults::STALL_WINDOW_MS
}

fn default_preempt_hysteresis_seconds() -> f64 {
    defaults::PREEMPT_HYSTERESIS_SECONDS
}

fn default_history_capacity() -> usize {
    defaults::FAILOVER_HISTORY_CAPACITY
}

fn default_healthy_reset_seconds() -> f64 {
    defaults::HEALTHY_RESET_SECONDS
}

/// Configuration for one audio source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Stable source name, unique within the manager.
    pub name: String,

    /// Source URI handed to the decoder subprocess (http://, file path,
    /// SDR device path, ...).
    pub uri: String,

    /// Failover priority; lower numbers are preferred.
    pub priority: i32,

    /// Windowed peak below this level counts as silence (dBFS).
    #[serde(default = "default_silence_threshold_dbfs")]
    pub silence_threshold_dbfs: f32,

    /// Sustained silence of this many seconds fails the source.
    /// Zero disables the silence rule.
    #[serde(default = "default_silence_duration_seconds")]
    pub silence_duration_seconds: f64,

    /// Seconds without samples before the watchdog fails the source.
    #[serde(default = "default_watchdog_timeout_seconds")]
    pub watchdog_timeout_seconds: f64,

    /// Consecutive restart attempts before parking in `GivingUp`.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Whether the source participates in failover.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Decoder binary override. Defaults to ffmpeg; anything accepting the
    /// same directive set (s16le, mono, rate, stdout) works.
    #[serde(default = "default_decoder")]
    pub decoder: String,
}

impl SourceConfig {
    /// Watchdog timeout as a `Duration`.
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.watchdog_timeout_seconds)
    }

    /// Silence duration as a `Duration`; `None` when the rule is disabled.
    pub fn silence_duration(&self) -> Option<Duration> {
        if self.silence_duration_seconds > 0.0 {
            Some(Duration::from_secs_f64(self.silence_duration_seconds))
        } else {
            None
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("source name must not be empty".to_string()));
        }
        if self.uri.trim().is_empty() {
            return Err(Error::Config(format!(
                "source '{}': uri must not be empty",
                self.name
            )));
        }
        if self.watchdog_timeout_seconds <= 0.0 {
            return Err(Error::Config(format!(
                "source '{}': watchdog_timeout_seconds must be positive",
                self.name
            )));
        }
        if self.silence_duration_seconds < 0.0 {
            return Err(Error::Config(format!(
                "source '{}': silence_duration_seconds must not be negative",
                self.name
            )));
        }
        Ok(())
    }
}

/// Failover loop tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Failover loop cadence in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Zero-output window (ms) that re-selects away from a degraded source.
    #[serde(default = "default_stall_window_ms")]
    pub stall_window_ms: u64,

    /// Minimum healthy time before a higher-priority source preempts.
    #[serde(default = "default_preempt_hysteresis_seconds")]
    pub preempt_hysteresis_seconds: f64,

    /// Bounded failover history length.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Continuous healthy time that resets a source's restart counter.
    #[serde(default = "default_healthy_reset_seconds")]
    pub healthy_reset_seconds: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            stall_window_ms: default_stall_window_ms(),
            preempt_hysteresis_seconds: default_preempt_hysteresis_seconds(),
            history_capacity: default_history_capacity(),
            healthy_reset_seconds: default_healthy_reset_seconds(),
        }
    }
}

impl FailoverConfig {
    /// Loop cadence as a `Duration`.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Stall window as a `Duration`.
    pub fn stall_window(&self) -> Duration {
        Duration::from_millis(self.stall_window_ms)
    }

    /// Preempt hysteresis as a `Duration`.
    pub fn preempt_hysteresis(&self) -> Duration {
        Duration::from_secs_f64(self.preempt_hysteresis_seconds)
    }

    /// Healthy-streak reset threshold as a `Duration`.
    pub fn healthy_reset(&self) -> Duration {
        Duration::from_secs_f64(self.healthy_reset_seconds)
    }
}

/// Whole-pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Pipeline sample rate in Hz. All sources are transcoded to this rate
    /// by their decoder subprocess.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Per-source ring buffer duration in seconds.
    #[serde(default = "default_source_buffer_seconds")]
    pub source_buffer_seconds: f64,

    /// Master buffer duration in seconds.
    #[serde(default = "default_master_buffer_seconds")]
    pub master_buffer_seconds: f64,

    /// Failover loop tuning.
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Configured sources, in priority tie-break order.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            source_buffer_seconds: default_source_buffer_seconds(),
            master_buffer_seconds: default_master_buffer_seconds(),
            failover: FailoverConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file with an optional sample-rate
    /// override from the command line.
    pub async fn load(config_path: &Path, sample_rate_override: Option<u32>) -> Result<Self> {
        let toml_str = tokio::fs::read_to_string(config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: IngestConfig = toml::from_str(&toml_str)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        if let Some(rate) = sample_rate_override {
            config.sample_rate = rate;
        }

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on values the manager cannot be constructed with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".to_string()));
        }
        if self.source_buffer_seconds <= 0.0 {
            return Err(Error::Config(
                "source_buffer_seconds must be positive".to_string(),
            ));
        }
        if self.master_buffer_seconds <= 0.0 {
            return Err(Error::Config(
                "master_buffer_seconds must be positive".to_string(),
            ));
        }
        if self.failover.tick_ms == 0 || self.failover.tick_ms > 1000 {
            return Err(Error::Config(
                "failover.tick_ms must be in 1..=1000".to_string(),
            ));
        }
        if self.failover.history_capacity == 0 {
            return Err(Error::Config(
                "failover.history_capacity must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }
        Ok(())
    }

    /// Source ring buffer capacity in samples.
    pub fn source_buffer_samples(&self) -> usize {
        (self.sample_rate as f64 * self.source_buffer_seconds) as usize
    }

    /// Master buffer capacity in samples.
    pub fn master_buffer_samples(&self) -> usize {
        (self.sample_rate as f64 * self.master_buffer_seconds) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, priority: i32) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            uri: format!("http://radio.example/{name}"),
            priority,
            silence_threshold_dbfs: default_silence_threshold_dbfs(),
            silence_duration_seconds: default_silence_duration_seconds(),
            watchdog_timeout_seconds: default_watchdog_timeout_seconds(),
            max_restart_attempts: default_max_restart_attempts(),
            enabled: true,
            decoder: default_decoder(),
        }
    }

    #[test]
    fn test_defaults_from_toml() {
        let toml_str = r#"
            [[sources]]
            name = "primary"
            uri = "http://radio.example/primary"
            priority = 10
        "#;
        let config: IngestConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.sample_rate, 22050);
        assert_eq!(config.source_buffer_seconds, 10.0);
        assert_eq!(config.master_buffer_seconds, 5.0);
        assert_eq!(config.failover.tick_ms, 100);
        assert_eq!(config.failover.history_capacity, 256);

        let src = &config.sources[0];
        assert_eq!(src.silence_threshold_dbfs, -50.0);
        assert_eq!(src.silence_duration_seconds, 10.0);
        assert_eq!(src.watchdog_timeout_seconds, 5.0);
        assert_eq!(src.max_restart_attempts, 10);
        assert!(src.enabled);
        assert_eq!(src.decoder, "ffmpeg");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = IngestConfig {
            sources: vec![source("monitor", 10), source("monitor", 20)],
            ..IngestConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_non_positive_timeout_rejected() {
        let mut bad = source("primary", 10);
        bad.watchdog_timeout_seconds = 0.0;
        let config = IngestConfig {
            sources: vec![bad],
            ..IngestConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_silence_duration_disables_rule() {
        let mut src = source("primary", 10);
        src.silence_duration_seconds = 0.0;
        assert!(src.silence_duration().is_none());
        assert!(src.validate().is_ok());
    }

    #[test]
    fn test_buffer_sample_math() {
        let config = IngestConfig::default();
        assert_eq!(config.source_buffer_samples(), 220_500);
        assert_eq!(config.master_buffer_samples(), 110_250);
    }

    #[test]
    fn test_equal_priorities_allowed() {
        // Ties are broken by configuration order, so equal priorities are
        // legal.
        let config = IngestConfig {
            sources: vec![source("a", 10), source("b", 10)],
            ..IngestConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
