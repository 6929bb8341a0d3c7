//! Self-healing source adapter
//!
//! Couples one decoder subprocess to one sample ring and makes the pair
//! behave as a health-reporting, self-restarting producer:
//!
//! - A **producer task** spawns the decoder, converts its PCM16LE output to
//!   float samples, writes them into the ring, and feeds the level window.
//!   On subprocess exit, read error, or spawn failure it schedules a
//!   restart under the exponential backoff policy.
//! - A **watchdog task** runs every 100 ms and checks liveness (samples
//!   still arriving), sustained silence, and degradation signals
//!   (overruns, below-nominal sample rate). Liveness or silence violations
//!   request a restart; degradation only moves the health state.
//!
//! Restart attempts are bounded: once `max_restart_attempts` consecutive
//! attempts fail without an intervening healthy streak, the adapter parks
//! in `GivingUp` until externally restarted.
//!
//! All cross-task state lives in a `SourceShared` of atomics; the only
//! locks are short critical sections around the ring consumer half, the
//! last-error slot, and the callback registration. No lock is held across
//! subprocess I/O.

use crate::config::SourceConfig;
use crate::error::Result;
use crate::ingest::decoder::{pcm16le_to_samples, DecoderProcess};
use crate::ingest::level::LevelWindow;
use crate::ingest::ring_buffer::{RingMetrics, SampleConsumer, SampleProducer, SampleRing};
use chrono::Utc;
use eas_common::defaults::{
    self, backoff_delay, FAILOVER_TICK_MS, MIN_RATE_FRACTION, STOP_GRACE_SECONDS,
    TASK_STOP_BUDGET_SECONDS,
};
use eas_common::events::{EventBus, FailoverReason, IngestEvent, SourceHealth};
use eas_common::metrics::SourceMetrics;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// PCM bytes per read from the decoder pipe (~93 ms of mono PCM16 at
/// 22050 Hz).
const PCM_CHUNK_BYTES: usize = 4096;

/// Health-callback invocation queue depth; snapshots beyond this are
/// dropped rather than ever blocking a state transition.
const CALLBACK_QUEUE_DEPTH: usize = 32;

/// Callback invoked with a fresh metrics snapshot on every health
/// transition. Must not block; it runs on a non-critical dispatcher task.
pub type HealthCallback = Arc<dyn Fn(SourceMetrics) + Send + Sync>;

/// Why the most recent failure happened, for failover event tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailCause {
    Crash,
    WatchdogTimeout,
    Silence,
}

impl FailCause {
    fn index(self) -> u8 {
        match self {
            FailCause::Crash => 1,
            FailCause::WatchdogTimeout => 2,
            FailCause::Silence => 3,
        }
    }

    fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(FailCause::Crash),
            2 => Some(FailCause::WatchdogTimeout),
            3 => Some(FailCause::Silence),
            _ => None,
        }
    }
}

enum StreamEnd {
    StopRequested,
    Failure(FailCause),
}

/// Cross-task adapter state. Timestamps are millisecond offsets from
/// `epoch` shifted by one so that zero always means "unset".
struct SourceShared {
    config: SourceConfig,
    sample_rate: u32,
    healthy_reset: Duration,
    epoch: Instant,

    health: AtomicU8,
    enabled: AtomicBool,
    stop_requested: AtomicBool,
    restart_requested: AtomicBool,

    restart_count: AtomicU32,
    consecutive_failures: AtomicU32,

    started_at_ms: AtomicU64,
    healthy_since_ms: AtomicU64,
    last_sample_at_ms: AtomicU64,
    last_loud_at_ms: AtomicU64,

    samples_total: AtomicU64,
    samples_per_sec_bits: AtomicU32,
    peak_dbfs_bits: AtomicU32,
    rms_dbfs_bits: AtomicU32,

    last_fail_cause: AtomicU8,
    last_error: Mutex<Option<String>>,

    ring_metrics: Mutex<Arc<RingMetrics>>,
    health_tx: Mutex<Option<mpsc::Sender<SourceMetrics>>>,
    callback: Arc<Mutex<Option<HealthCallback>>>,
    events: EventBus,
}

impl SourceShared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn health(&self) -> SourceHealth {
        SourceHealth::from_index(self.health.load(Ordering::Acquire))
            .unwrap_or(SourceHealth::Stopped)
    }

    fn stop_flagged(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn ring_metrics(&self) -> Arc<RingMetrics> {
        Arc::clone(&self.ring_metrics.lock().unwrap())
    }

    fn record_error(&self, message: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(message.into());
    }

    /// Transition the health state; no-op when unchanged. Publishes the
    /// change on the event bus and hands a snapshot to the callback
    /// dispatcher (dropped if its queue is full).
    fn set_health(&self, new: SourceHealth) {
        let old_idx = self.health.swap(new.index(), Ordering::AcqRel);
        let old = SourceHealth::from_index(old_idx).unwrap_or(SourceHealth::Stopped);
        if old == new {
            return;
        }

        if new == SourceHealth::Healthy {
            self.healthy_since_ms.store(self.now_ms(), Ordering::Relaxed);
        } else {
            self.healthy_since_ms.store(0, Ordering::Relaxed);
        }

        info!(
            source = %self.config.name,
            from = %old,
            to = %new,
            "Source health changed"
        );
        self.events.publish(IngestEvent::SourceHealthChanged {
            source: self.config.name.clone(),
            from: old,
            to: new,
            timestamp: Utc::now(),
        });

        if let Some(tx) = self.health_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(self.metrics_snapshot());
        }
    }

    fn metrics_snapshot(&self) -> SourceMetrics {
        let now = self.now_ms();
        let started = self.started_at_ms.load(Ordering::Relaxed);
        let healthy_since = self.healthy_since_ms.load(Ordering::Relaxed);
        let ring = self.ring_metrics();
        let stats = ring.snapshot();

        SourceMetrics {
            name: self.config.name.clone(),
            health: self.health(),
            priority: self.config.priority,
            enabled: self.enabled.load(Ordering::Relaxed),
            uptime_seconds: if started == 0 {
                0.0
            } else {
                now.saturating_sub(started) as f64 / 1000.0
            },
            healthy_streak_seconds: if healthy_since == 0 {
                0.0
            } else {
                now.saturating_sub(healthy_since) as f64 / 1000.0
            },
            samples_per_second: f32::from_bits(self.samples_per_sec_bits.load(Ordering::Relaxed)),
            restart_count: self.restart_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            buffer_fill: ring.fill_fraction(),
            overruns: stats.overruns,
            underruns: stats.underruns,
            peak_dbfs: f32::from_bits(self.peak_dbfs_bits.load(Ordering::Relaxed)),
            rms_dbfs: f32::from_bits(self.rms_dbfs_bits.load(Ordering::Relaxed)),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }

    /// Watchdog side of a restart: record the cause and wake the producer,
    /// which owns the decoder and performs the actual stop/backoff cycle.
    fn request_restart(&self, cause: FailCause, why: &str) {
        if self.restart_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        self.last_fail_cause.store(cause.index(), Ordering::Relaxed);
        self.record_error(why);
        warn!(source = %self.config.name, "{}; restarting decoder", why);
    }

    /// Enter `Failed` with the given cause. Called before the decoder is
    /// torn down so the manager can react within one tick instead of
    /// waiting out the subprocess grace window.
    fn mark_failed(&self, cause: FailCause) {
        self.last_fail_cause.store(cause.index(), Ordering::Relaxed);
        self.set_health(SourceHealth::Failed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Decide the failed source's fate: park in `GivingUp` (returns false)
    /// or sleep out the backoff and return true to retry. Also returns
    /// false when a stop arrives mid-sleep.
    async fn backoff_or_give_up(&self) -> bool {
        let attempt = self.restart_count.load(Ordering::Relaxed);
        if attempt >= self.config.max_restart_attempts {
            error!(
                source = %self.config.name,
                attempts = attempt,
                "Restart attempts exhausted, giving up"
            );
            self.set_health(SourceHealth::GivingUp);
            self.events.publish(IngestEvent::SourceGaveUp {
                source: self.config.name.clone(),
                attempts: attempt,
                timestamp: Utc::now(),
            });
            return false;
        }

        let delay = backoff_delay(attempt);
        self.restart_count.store(attempt + 1, Ordering::Relaxed);
        info!(
            source = %self.config.name,
            attempt = attempt + 1,
            max = self.config.max_restart_attempts,
            "Restarting decoder in {:.1}s",
            delay.as_secs_f64()
        );
        self.events.publish(IngestEvent::SourceRestarted {
            source: self.config.name.clone(),
            attempt: attempt + 1,
            timestamp: Utc::now(),
        });

        self.sleep_unless_stopped(delay).await
    }

    /// Sleep in small slices so a stop request is observed promptly.
    /// Returns false when stopped before the delay elapsed.
    async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop_flagged() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(Duration::from_millis(50))).await;
        }
    }
}

/// One self-healing audio source: decoder subprocess, sample ring,
/// watchdog, restart policy, health metrics.
pub struct SourceAdapter {
    shared: Arc<SourceShared>,
    buffer_samples: usize,
    consumer: Mutex<SampleConsumer>,
    worker_tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl SourceAdapter {
    /// Create a stopped adapter with its ring pre-allocated.
    pub fn new(
        config: SourceConfig,
        sample_rate: u32,
        buffer_samples: usize,
        healthy_reset: Duration,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let (producer, consumer) = SampleRing::with_capacity(buffer_samples)?;
        let ring_metrics = producer.metrics();
        // The construction-time producer half is dropped: a fresh ring is
        // split for every start so a restarted adapter begins empty.
        drop(producer);

        let floor = defaults::SILENCE_FLOOR_DBFS.to_bits();
        let enabled = config.enabled;

        let shared = Arc::new(SourceShared {
            config,
            sample_rate,
            healthy_reset,
            epoch: Instant::now(),
            health: AtomicU8::new(SourceHealth::Stopped.index()),
            enabled: AtomicBool::new(enabled),
            stop_requested: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            restart_count: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            started_at_ms: AtomicU64::new(0),
            healthy_since_ms: AtomicU64::new(0),
            last_sample_at_ms: AtomicU64::new(0),
            last_loud_at_ms: AtomicU64::new(0),
            samples_total: AtomicU64::new(0),
            samples_per_sec_bits: AtomicU32::new(0.0f32.to_bits()),
            peak_dbfs_bits: AtomicU32::new(floor),
            rms_dbfs_bits: AtomicU32::new(floor),
            last_fail_cause: AtomicU8::new(0),
            last_error: Mutex::new(None),
            ring_metrics: Mutex::new(ring_metrics),
            health_tx: Mutex::new(None),
            callback: Arc::new(Mutex::new(None)),
            events,
        });

        Ok(Self {
            shared,
            buffer_samples,
            consumer: Mutex::new(consumer),
            worker_tasks: Mutex::new(Vec::new()),
            dispatcher_task: Mutex::new(None),
        })
    }

    /// Spawn the producer and watchdog tasks. Idempotent; a start after
    /// `GivingUp` is the external reset that re-arms the restart budget.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.worker_tasks.lock().unwrap();
        if !tasks.is_empty() {
            return Ok(());
        }

        let shared = &self.shared;
        shared.stop_requested.store(false, Ordering::Release);
        shared.restart_requested.store(false, Ordering::Release);
        shared.restart_count.store(0, Ordering::Relaxed);
        shared.consecutive_failures.store(0, Ordering::Relaxed);
        shared.samples_total.store(0, Ordering::Relaxed);
        shared
            .samples_per_sec_bits
            .store(0.0f32.to_bits(), Ordering::Relaxed);

        // Fresh ring every start: a restarted adapter begins empty
        let (producer, consumer) = SampleRing::with_capacity(self.buffer_samples)?;
        *shared.ring_metrics.lock().unwrap() = producer.metrics();
        *self.consumer.lock().unwrap() = consumer;

        let now = shared.now_ms();
        shared.started_at_ms.store(now, Ordering::Relaxed);
        shared.last_sample_at_ms.store(now, Ordering::Relaxed);
        shared.last_loud_at_ms.store(now, Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(CALLBACK_QUEUE_DEPTH);
        *shared.health_tx.lock().unwrap() = Some(tx);
        *self.dispatcher_task.lock().unwrap() = Some(tokio::spawn(callback_dispatcher(
            rx,
            Arc::clone(&shared.callback),
        )));

        shared.set_health(SourceHealth::Starting);

        tasks.push((
            "producer",
            tokio::spawn(producer_task(Arc::clone(shared), producer)),
        ));
        tasks.push(("watchdog", tokio::spawn(watchdog_task(Arc::clone(shared)))));

        info!(
            source = %shared.config.name,
            uri = %shared.config.uri,
            priority = shared.config.priority,
            "Source adapter started"
        );
        Ok(())
    }

    /// Stop both tasks and the decoder subprocess, drain the ring, and
    /// settle in `Stopped`. Idempotent.
    ///
    /// The producer gets the task-stop budget plus the decoder grace
    /// window (it terminates the subprocess on its way out); anything
    /// still running past that is logged as stuck and aborted — the
    /// kill-on-drop child guard prevents subprocess leaks even then.
    pub async fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);

        let tasks: Vec<_> = self.worker_tasks.lock().unwrap().drain(..).collect();
        let producer_budget = Duration::from_secs_f64(TASK_STOP_BUDGET_SECONDS)
            + Duration::from_secs_f64(STOP_GRACE_SECONDS);
        let watchdog_budget = Duration::from_secs_f64(TASK_STOP_BUDGET_SECONDS);

        for (name, mut handle) in tasks {
            let budget = if name == "producer" {
                producer_budget
            } else {
                watchdog_budget
            };
            if timeout(budget, &mut handle).await.is_err() {
                warn!(
                    source = %self.shared.config.name,
                    task = name,
                    "Task did not observe stop within {:.1}s, aborting",
                    budget.as_secs_f64()
                );
                handle.abort();
            }
        }

        self.shared.set_health(SourceHealth::Stopped);
        self.shared.started_at_ms.store(0, Ordering::Relaxed);

        // Close the callback queue and let the dispatcher drain out
        *self.shared.health_tx.lock().unwrap() = None;
        let dispatcher = self.dispatcher_task.lock().unwrap().take();
        if let Some(mut handle) = dispatcher {
            if timeout(watchdog_budget, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        // A stopped adapter holds no resident samples
        self.consumer.lock().unwrap().drain();

        debug!(source = %self.shared.config.name, "Source adapter stopped");
    }

    /// Read exactly `n` samples from the ring, or `None`. Never blocks.
    pub fn read_samples(&self, n: usize) -> Option<Vec<f32>> {
        self.consumer.lock().unwrap().read(n)
    }

    /// Samples currently buffered (lower-bound estimate).
    pub fn available(&self) -> usize {
        self.consumer.lock().unwrap().available()
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> SourceMetrics {
        self.shared.metrics_snapshot()
    }

    /// Register the health-transition callback. Replaces any previous one.
    pub fn set_health_callback(&self, callback: HealthCallback) {
        *self.shared.callback.lock().unwrap() = Some(callback);
    }

    /// Source name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Failover priority (lower = preferred).
    pub fn priority(&self) -> i32 {
        self.shared.config.priority
    }

    /// Current health state.
    pub fn health(&self) -> SourceHealth {
        self.shared.health()
    }

    /// Whether the source participates in failover.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Flip the enabled flag (the manager starts/stops the adapter around
    /// this).
    pub fn set_enabled_flag(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Seconds of continuous `Healthy`, for preemption hysteresis.
    pub fn healthy_streak(&self) -> Duration {
        let since = self.shared.healthy_since_ms.load(Ordering::Relaxed);
        if since == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.shared.now_ms().saturating_sub(since))
        }
    }

    /// Failover reason matching the most recent failure.
    pub fn last_failure_reason(&self) -> FailoverReason {
        match FailCause::from_index(self.shared.last_fail_cause.load(Ordering::Relaxed)) {
            Some(FailCause::WatchdogTimeout) => FailoverReason::WatchdogTimeout,
            Some(FailCause::Silence) => FailoverReason::Silence,
            _ => FailoverReason::Crash,
        }
    }
}

/// Producer task: decoder lifecycle, PCM conversion, ring writes, level
/// metering, restart/backoff policy.
async fn producer_task(shared: Arc<SourceShared>, mut producer: SampleProducer) {
    let mut buf = vec![0u8; PCM_CHUNK_BYTES];
    let mut samples: Vec<f32> = Vec::with_capacity(PCM_CHUNK_BYTES / 2);
    let mut level = LevelWindow::new(shared.sample_rate);
    let mut carry: Option<u8> = None;

    loop {
        if shared.stop_flagged() {
            break;
        }

        shared.set_health(SourceHealth::Starting);
        level.reset();
        carry = None;
        let now = shared.now_ms();
        shared.last_sample_at_ms.store(now, Ordering::Relaxed);
        shared.last_loud_at_ms.store(now, Ordering::Relaxed);
        shared.restart_requested.store(false, Ordering::Release);

        let mut decoder = DecoderProcess::new(
            &shared.config.name,
            &shared.config.uri,
            &shared.config.decoder,
            shared.sample_rate,
        );

        if let Err(e) = decoder.start() {
            shared.record_error(e.to_string());
            shared.mark_failed(FailCause::Crash);
            if !shared.backoff_or_give_up().await {
                break;
            }
            continue;
        }

        let outcome = read_stream(
            &shared,
            &mut decoder,
            &mut producer,
            &mut buf,
            &mut samples,
            &mut level,
            &mut carry,
        )
        .await;

        match outcome {
            StreamEnd::StopRequested => {
                decoder.stop().await;
                break;
            }
            StreamEnd::Failure(cause) => {
                // Failed becomes visible before the (possibly slow)
                // subprocess teardown
                shared.mark_failed(cause);
                decoder.stop().await;
                if let Some(excerpt) = decoder.last_error() {
                    shared.record_error(excerpt);
                }
                if !shared.backoff_or_give_up().await {
                    break;
                }
            }
        }
    }

    debug!(source = %shared.config.name, "Producer task exiting");
}

/// Inner read loop for one decoder incarnation. Returns why it ended.
async fn read_stream(
    shared: &SourceShared,
    decoder: &mut DecoderProcess,
    producer: &mut SampleProducer,
    buf: &mut [u8],
    samples: &mut Vec<f32>,
    level: &mut LevelWindow,
    carry: &mut Option<u8>,
) -> StreamEnd {
    loop {
        if shared.stop_flagged() {
            return StreamEnd::StopRequested;
        }
        if shared.restart_requested.swap(false, Ordering::AcqRel) {
            let cause = FailCause::from_index(shared.last_fail_cause.load(Ordering::Relaxed))
                .unwrap_or(FailCause::Crash);
            return StreamEnd::Failure(cause);
        }

        tokio::select! {
            result = decoder.read_pcm(buf) => match result {
                Ok(0) => {
                    shared.record_error("decoder stream ended");
                    return StreamEnd::Failure(FailCause::Crash);
                }
                Ok(n) => {
                    pcm16le_to_samples(carry, &buf[..n], samples);
                    if samples.is_empty() {
                        continue;
                    }

                    producer.write(samples);
                    level.push_chunk(samples);

                    let now = shared.now_ms();
                    shared.last_sample_at_ms.store(now, Ordering::Relaxed);
                    shared
                        .samples_total
                        .fetch_add(samples.len() as u64, Ordering::Relaxed);

                    let peak_dbfs = level.peak_dbfs();
                    shared
                        .peak_dbfs_bits
                        .store(peak_dbfs.to_bits(), Ordering::Relaxed);
                    shared
                        .rms_dbfs_bits
                        .store(level.rms_dbfs().to_bits(), Ordering::Relaxed);
                    if peak_dbfs > shared.config.silence_threshold_dbfs {
                        shared.last_loud_at_ms.store(now, Ordering::Relaxed);
                    }

                    if shared.health() == SourceHealth::Starting {
                        shared.set_health(SourceHealth::Healthy);
                    }
                }
                Err(e) => {
                    shared.record_error(e.to_string());
                    return StreamEnd::Failure(FailCause::Crash);
                }
            },
            // Re-check stop/restart flags even while the pipe is quiet
            _ = sleep(Duration::from_millis(100)) => {}
        }
    }
}

/// Watchdog task: liveness, silence, degradation, restart-budget reset.
async fn watchdog_task(shared: Arc<SourceShared>) {
    let cadence = Duration::from_millis(FAILOVER_TICK_MS);
    let watchdog_timeout = shared.config.watchdog_timeout();
    let silence_duration = shared.config.silence_duration();
    let nominal_rate = shared.sample_rate as f64;
    let healthy_reset_ms = shared.healthy_reset.as_millis() as u64;

    // (observation time, cumulative samples) pairs spanning about a second
    let mut rate_window: VecDeque<(Instant, u64)> = VecDeque::new();
    let mut prev_overruns = 0u64;

    loop {
        sleep(cadence).await;
        if shared.stop_flagged() {
            break;
        }

        // Observed samples/sec over the recent window
        let total = shared.samples_total.load(Ordering::Relaxed);
        let now_i = Instant::now();
        rate_window.push_back((now_i, total));
        while rate_window.len() > 2
            && now_i.duration_since(rate_window.front().unwrap().0) > Duration::from_secs(1)
        {
            rate_window.pop_front();
        }
        let window_span = rate_window
            .front()
            .map(|(t, _)| now_i.duration_since(*t))
            .unwrap_or(Duration::ZERO);
        let sps = if window_span > Duration::ZERO {
            let (_, first_total) = rate_window.front().unwrap();
            (total.saturating_sub(*first_total)) as f64 / window_span.as_secs_f64()
        } else {
            0.0
        };
        shared
            .samples_per_sec_bits
            .store((sps as f32).to_bits(), Ordering::Relaxed);

        let health = shared.health();
        if !matches!(
            health,
            SourceHealth::Starting | SourceHealth::Healthy | SourceHealth::Degraded
        ) {
            continue;
        }

        let now = shared.now_ms();
        let sample_age =
            Duration::from_millis(now.saturating_sub(shared.last_sample_at_ms.load(Ordering::Relaxed)));
        let loud_age =
            Duration::from_millis(now.saturating_sub(shared.last_loud_at_ms.load(Ordering::Relaxed)));

        // Liveness: no samples within the watchdog window fails the source
        // (covers the startup window too)
        if sample_age >= watchdog_timeout {
            shared.request_restart(
                FailCause::WatchdogTimeout,
                &format!("no samples for {:.1}s", sample_age.as_secs_f64()),
            );
            continue;
        }

        if health == SourceHealth::Starting {
            continue;
        }

        // Sustained silence fails the source outright
        if let Some(silence) = silence_duration {
            if loud_age >= silence {
                shared.request_restart(
                    FailCause::Silence,
                    &format!("silent for {:.1}s", loud_age.as_secs_f64()),
                );
                continue;
            }
        }

        // Degradation signals: overruns advancing, transient quiet, or
        // throughput below the nominal-rate floor
        let overruns = shared.ring_metrics().overruns();
        let overrun_delta = overruns.saturating_sub(prev_overruns);
        prev_overruns = overruns;

        let quiet = silence_duration.is_some()
            && f32::from_bits(shared.peak_dbfs_bits.load(Ordering::Relaxed))
                < shared.config.silence_threshold_dbfs;

        let warmed_up = now.saturating_sub(shared.started_at_ms.load(Ordering::Relaxed)) > 2000
            && window_span >= Duration::from_millis(900);
        let slow = warmed_up && sps < nominal_rate * MIN_RATE_FRACTION;

        let degraded = overrun_delta > 0 || quiet || slow;
        if degraded && health == SourceHealth::Healthy {
            debug!(
                source = %shared.config.name,
                overrun_delta,
                quiet,
                slow,
                "Source degraded"
            );
            shared.set_health(SourceHealth::Degraded);
        } else if !degraded && health == SourceHealth::Degraded {
            shared.set_health(SourceHealth::Healthy);
        }

        // A sustained healthy streak re-arms the restart budget
        let healthy_since = shared.healthy_since_ms.load(Ordering::Relaxed);
        if healthy_since != 0
            && now.saturating_sub(healthy_since) >= healthy_reset_ms
            && shared.restart_count.load(Ordering::Relaxed) != 0
        {
            info!(
                source = %shared.config.name,
                "Healthy for {:.0}s, resetting restart counter",
                shared.healthy_reset.as_secs_f64()
            );
            shared.restart_count.store(0, Ordering::Relaxed);
            shared.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    debug!(source = %shared.config.name, "Watchdog task exiting");
}

/// Non-critical dispatcher: invokes the registered callback with queued
/// snapshots. Ends when the adapter closes the queue.
async fn callback_dispatcher(
    mut rx: mpsc::Receiver<SourceMetrics>,
    callback: Arc<Mutex<Option<HealthCallback>>>,
) {
    while let Some(snapshot) = rx.recv().await {
        let cb = callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(snapshot);
        }
    }
}
