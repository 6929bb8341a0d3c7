//! Decoder subprocess supervision
//!
//! A [`DecoderProcess`] owns one external media-decoder child (ffmpeg by
//! default) that reads an opaque source URI and writes PCM16LE mono at the
//! pipeline rate to its stdout. The value owns the child: `kill_on_drop`
//! guarantees the subprocess dies with its owner on every failure path, so
//! zombies and leaked descriptors are impossible by construction rather
//! than by discipline.
//!
//! Shutdown is graceful-then-forceful: closing the stdout pipe lets the
//! decoder wind down on its own (EOF/SIGPIPE on the next write); if it is
//! still running after the grace window it is killed and reaped.

use crate::error::{Error, Result};
use eas_common::defaults::STOP_GRACE_SECONDS;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Build the canonical decoder argument vector: input URI in, signed
/// 16-bit little-endian mono at the target rate out, no container, quiet
/// logging, stream to stdout.
pub fn decoder_args(uri: &str, sample_rate: u32) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        uri.to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-acodec".to_string(),
        "pcm_s16le".to_string(),
        "-ac".to_string(),
        "1".to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-".to_string(),
    ]
}

/// Convert a PCM16LE byte stream chunk to normalized float32 samples.
///
/// Chunks from a pipe can split a sample across reads; `carry` holds the
/// dangling low byte between calls. `out` is cleared and refilled.
pub fn pcm16le_to_samples(carry: &mut Option<u8>, bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();

    let mut rest = bytes;
    if let Some(lo) = carry.take() {
        match rest.first() {
            Some(&hi) => {
                out.push(i16::from_le_bytes([lo, hi]) as f32 / 32768.0);
                rest = &rest[1..];
            }
            None => {
                *carry = Some(lo);
                return;
            }
        }
    }

    let chunks = rest.chunks_exact(2);
    let remainder = chunks.remainder();
    for pair in chunks {
        out.push(i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0);
    }
    if let [dangling] = remainder {
        *carry = Some(*dangling);
    }
}

/// One supervised decoder subprocess.
///
/// Exactly one child is live between `start()` and `stop()`; after
/// `stop()` returns, no subprocess or descriptor related to this instance
/// remains.
pub struct DecoderProcess {
    source: String,
    uri: String,
    binary: String,
    sample_rate: u32,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl DecoderProcess {
    /// Create a (not yet started) decoder for one source.
    pub fn new(source: &str, uri: &str, binary: &str, sample_rate: u32) -> Self {
        Self {
            source: source.to_string(),
            uri: uri.to_string(),
            binary: binary.to_string(),
            sample_rate,
            child: None,
            stdout: None,
            stderr_task: None,
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the subprocess with stdout piped for PCM and stderr collected
    /// for diagnostics. No-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let args = decoder_args(&self.uri, self.sample_rate);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let reason = e.to_string();
                *self.last_error.lock().unwrap() = Some(reason.clone());
                Error::Spawn {
                    source_name: self.source.clone(),
                    reason,
                }
            })?;

        self.stdout = child.stdout.take();

        if let Some(stderr) = child.stderr.take() {
            let source = self.source.clone();
            let last_error = Arc::clone(&self.last_error);
            self.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        debug!(source = %source, "decoder stderr: {}", line);
                        *last_error.lock().unwrap() = Some(line);
                    }
                }
            }));
        }

        info!(
            source = %self.source,
            binary = %self.binary,
            uri = %self.uri,
            rate = self.sample_rate,
            "Decoder subprocess started"
        );

        self.child = Some(child);
        Ok(())
    }

    /// Read up to `buf.len()` PCM bytes from the subprocess stdout.
    ///
    /// Returns 0 at end-of-stream. May block on the pipe; only the
    /// producer task calls this.
    pub async fn read_pcm(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stdout = self.stdout.as_mut().ok_or_else(|| Error::Read {
            source_name: self.source.clone(),
            reason: "decoder stdout not open".to_string(),
        })?;

        stdout.read(buf).await.map_err(|e| Error::Read {
            source_name: self.source.clone(),
            reason: e.to_string(),
        })
    }

    /// True iff the subprocess has not exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the subprocess: close its output pipe, wait out the grace
    /// window, then kill. The child is reaped unconditionally. Idempotent.
    pub async fn stop(&mut self) {
        self.stdout = None;

        if let Some(mut child) = self.child.take() {
            let grace = Duration::from_secs_f64(STOP_GRACE_SECONDS);
            let status = match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!(source = %self.source, "Error waiting for decoder: {}", e);
                    None
                }
                Err(_) => {
                    debug!(
                        source = %self.source,
                        "Decoder still running after {:.1}s grace, killing",
                        grace.as_secs_f64()
                    );
                    if let Err(e) = child.start_kill() {
                        warn!(source = %self.source, "Failed to kill decoder: {}", e);
                    }
                    match child.wait().await {
                        Ok(status) => Some(status),
                        Err(e) => {
                            warn!(source = %self.source, "Error reaping decoder: {}", e);
                            None
                        }
                    }
                }
            };

            match status {
                Some(status) if status.success() => {
                    info!(source = %self.source, "Decoder exited cleanly");
                }
                Some(status) => {
                    let excerpt = self.last_error();
                    warn!(
                        source = %self.source,
                        %status,
                        stderr = excerpt.as_deref().unwrap_or("<none>"),
                        "Decoder exited abnormally"
                    );
                    let mut slot = self.last_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(format!("decoder exited with {}", status));
                    }
                }
                None => {}
            }
        }

        // The stderr collector ends at pipe EOF; give it a moment to drain
        // the final lines, then drop it.
        if let Some(mut task) = self.stderr_task.take() {
            if timeout(Duration::from_millis(100), &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    /// Most recent stderr excerpt or failure reason, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Source URI this decoder reads from.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}
