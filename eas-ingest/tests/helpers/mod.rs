//! Shared fixtures for ingest integration tests
//!
//! Tests drive the real pipeline against stub decoder scripts: each stub
//! ignores the ffmpeg-style argument vector and writes known PCM16LE bytes
//! to stdout, so the subprocess supervision, conversion, metering, and
//! failover paths are exercised end to end without a media decoder on the
//! host.

use eas_ingest::config::{FailoverConfig, IngestConfig, SourceConfig};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Pipeline rate used across the integration tests.
pub const TEST_RATE: u32 = 22050;

/// Write `seconds` of loud PCM16LE (square-ish wave, ~-12 dBFS).
pub fn write_loud_pcm(path: &Path, seconds: f64) {
    let total = (TEST_RATE as f64 * seconds) as usize;
    let mut bytes = Vec::with_capacity(total * 2);
    for i in 0..total {
        let value: i16 = if (i / 25) % 2 == 0 { 8000 } else { -8000 };
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    std::fs::write(path, &bytes).unwrap();
}

/// Write `seconds` of digital silence.
pub fn write_silent_pcm(path: &Path, seconds: f64) {
    let total = (TEST_RATE as f64 * seconds) as usize;
    std::fs::write(path, vec![0u8; total * 2]).unwrap();
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stub decoder that streams the first 0.1 s of `pcm` roughly in real
/// time, forever.
pub fn streaming_stub(dir: &Path, name: &str, pcm: &Path) -> PathBuf {
    let chunk = TEST_RATE as usize / 10 * 2;
    write_script(
        dir,
        name,
        &format!(
            "#!/bin/sh\nwhile :; do dd if={} bs={} count=1 2>/dev/null; sleep 0.1; done\n",
            pcm.display(),
            chunk
        ),
    )
}

/// Stub decoder that streams `pcm` the same way but starts only after
/// `delay_seconds` (a source that takes a while to come online).
pub fn delayed_stub(dir: &Path, name: &str, pcm: &Path, delay_seconds: f64) -> PathBuf {
    let chunk = TEST_RATE as usize / 10 * 2;
    write_script(
        dir,
        name,
        &format!(
            "#!/bin/sh\nsleep {}\nwhile :; do dd if={} bs={} count=1 2>/dev/null; sleep 0.1; done\n",
            delay_seconds,
            pcm.display(),
            chunk
        ),
    )
}

/// Stub decoder that emits one chunk of `pcm` then exits non-zero (a
/// crashing source).
pub fn crashing_stub(dir: &Path, name: &str, pcm: &Path) -> PathBuf {
    let chunk = TEST_RATE as usize / 10 * 2;
    write_script(
        dir,
        name,
        &format!(
            "#!/bin/sh\ndd if={} bs={} count=1 2>/dev/null\nsleep 0.1\nexit 3\n",
            pcm.display(),
            chunk
        ),
    )
}

/// Source config with test-scale timings.
pub fn test_source(name: &str, priority: i32, decoder: &Path) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        uri: format!("stub://{name}"),
        priority,
        silence_threshold_dbfs: -50.0,
        // Silence rule off by default; tests that need it override
        silence_duration_seconds: 0.0,
        watchdog_timeout_seconds: 5.0,
        max_restart_attempts: 10,
        enabled: true,
        decoder: decoder.to_string_lossy().to_string(),
    }
}

/// Pipeline config with small buffers and fast failover for tests.
pub fn test_config(sources: Vec<SourceConfig>) -> IngestConfig {
    IngestConfig {
        sample_rate: TEST_RATE,
        source_buffer_seconds: 2.0,
        master_buffer_seconds: 1.0,
        failover: FailoverConfig {
            tick_ms: 50,
            stall_window_ms: 500,
            preempt_hysteresis_seconds: 0.5,
            history_capacity: 256,
            healthy_reset_seconds: 60.0,
        },
        sources,
    }
}

/// Poll `condition` every 50 ms until it holds or `deadline` elapses.
pub async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
