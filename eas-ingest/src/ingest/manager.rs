//! Multi-source manager: failover state machine and master buffer pump
//!
//! Composes N source adapters and one master ring into a single
//! always-available sample stream. A dedicated loop task runs every tick
//! (100 ms default) and:
//!
//! 1. Re-runs the selection rule when the active source stops serving or
//!    stalls: among `Healthy`/`Degraded` enabled sources, lowest priority
//!    number wins, ties broken by configuration order.
//! 2. Preempts back to a higher-priority source once it has held `Healthy`
//!    for the hysteresis window.
//! 3. Drains the active source's ring into the master buffer, bounded per
//!    iteration so recovery never starves other tasks.
//!
//! A failover event is recorded iff the active identity changes; a source
//! that is merely restarting keeps the active role (and the master buffer
//! simply runs dry) so a single-source outage is visible as underflow, not
//! as event noise. The manager never synthesizes silence to mask an
//! outage and never exits on adapter failure.

use crate::config::{IngestConfig, SourceConfig};
use crate::error::{Error, Result};
use crate::ingest::adapter::SourceAdapter;
use crate::ingest::health::HealthReporter;
use crate::ingest::ring_buffer::{RingMetrics, SampleConsumer, SampleProducer, SampleRing};
use chrono::Utc;
use eas_common::defaults::TASK_STOP_BUDGET_SECONDS;
use eas_common::events::{EventBus, FailoverEvent, FailoverReason, IngestEvent, SourceHealth};
use eas_common::metrics::{BufferStats, SourceMetrics};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Callback invoked with every failover event. Dispatched off the failover
/// loop; must not assume any ordering with respect to `read_audio`.
pub type FailoverCallback = Arc<dyn Fn(FailoverEvent) + Send + Sync>;

/// Target selector for [`SourceManager::force_failover`].
pub const FAILOVER_NEXT: &str = "next";

pub(crate) struct ManagerShared {
    pub(crate) config: IngestConfig,
    adapters: Mutex<Vec<Arc<SourceAdapter>>>,
    active: Mutex<Option<String>>,
    master_consumer: Mutex<SampleConsumer>,
    master_metrics: Mutex<Arc<RingMetrics>>,
    history: Mutex<VecDeque<FailoverEvent>>,
    manual_request: Mutex<Option<String>>,
    failover_cb: Mutex<Option<FailoverCallback>>,
    events: EventBus,
    running: AtomicBool,
    stop_requested: AtomicBool,
    ever_activated: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn active_name(&self) -> Option<String> {
        self.active.lock().unwrap().clone()
    }

    pub(crate) fn all_metrics_ordered(&self) -> Vec<SourceMetrics> {
        self.adapters
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.metrics())
            .collect()
    }

    pub(crate) fn recent_history(&self, limit: usize) -> Vec<FailoverEvent> {
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn master_snapshot(&self) -> BufferStats {
        self.master_metrics.lock().unwrap().snapshot()
    }

    fn adapters_snapshot(&self) -> Vec<Arc<SourceAdapter>> {
        self.adapters.lock().unwrap().clone()
    }

    /// Record a cut-over: bounded history, callback dispatch, event bus.
    fn emit_failover(
        &self,
        from: Option<String>,
        to: Option<String>,
        reason: FailoverReason,
        note: Option<String>,
    ) {
        let event = FailoverEvent {
            from,
            to,
            reason,
            note,
            timestamp: Utc::now(),
        };

        info!(
            from = event.from.as_deref().unwrap_or("<none>"),
            to = event.to.as_deref().unwrap_or("<none>"),
            reason = %event.reason,
            note = event.note.as_deref().unwrap_or(""),
            "Failover"
        );

        {
            let mut history = self.history.lock().unwrap();
            while history.len() >= self.config.failover.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.ever_activated.store(true, Ordering::Relaxed);

        if let Some(cb) = self.failover_cb.lock().unwrap().clone() {
            let dispatched = event.clone();
            tokio::spawn(async move { cb(dispatched) });
        }

        self.events.publish(IngestEvent::FailoverOccurred { event });
    }
}

/// Priority-ordered ingest of N sources into one master sample stream.
pub struct SourceManager {
    shared: Arc<ManagerShared>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager").finish_non_exhaustive()
    }
}

impl SourceManager {
    /// Validate the configuration and build all adapters (stopped).
    ///
    /// Fails fast with `Config` on duplicate names or unusable timeouts.
    pub fn new(config: IngestConfig) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let source_samples = config.source_buffer_samples();
        let healthy_reset = config.failover.healthy_reset();

        let mut adapters = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            adapters.push(Arc::new(SourceAdapter::new(
                source.clone(),
                config.sample_rate,
                source_samples,
                healthy_reset,
                events.clone(),
            )?));
        }

        let (producer, consumer) = SampleRing::with_capacity(config.master_buffer_samples())?;
        let master_metrics = producer.metrics();
        // As with the adapters, the master ring is split fresh at start;
        // this construction-time half only backs read_audio before start.
        drop(producer);

        Ok(Self {
            shared: Arc::new(ManagerShared {
                config,
                adapters: Mutex::new(adapters),
                active: Mutex::new(None),
                master_consumer: Mutex::new(consumer),
                master_metrics: Mutex::new(master_metrics),
                history: Mutex::new(VecDeque::new()),
                manual_request: Mutex::new(None),
                failover_cb: Mutex::new(None),
                events,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                ever_activated: AtomicBool::new(false),
            }),
            pump_task: Mutex::new(None),
        })
    }

    /// Start every enabled adapter and the failover loop. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.stop_requested.store(false, Ordering::Release);

        // Fresh master ring for this run
        let (producer, consumer) =
            SampleRing::with_capacity(self.shared.config.master_buffer_samples())?;
        *self.shared.master_metrics.lock().unwrap() = producer.metrics();
        *self.shared.master_consumer.lock().unwrap() = consumer;

        for adapter in self.shared.adapters_snapshot() {
            if adapter.is_enabled() {
                adapter.start()?;
            }
        }

        *self.pump_task.lock().unwrap() = Some(tokio::spawn(failover_loop(
            Arc::clone(&self.shared),
            producer,
        )));

        self.shared.events.publish(IngestEvent::PipelineStarted {
            timestamp: Utc::now(),
        });
        info!(
            sources = self.shared.adapters.lock().unwrap().len(),
            rate = self.shared.config.sample_rate,
            "Source manager started"
        );
        Ok(())
    }

    /// Stop the failover loop and every adapter. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.stop_requested.store(true, Ordering::Release);

        let pump = self.pump_task.lock().unwrap().take();
        if let Some(mut handle) = pump {
            let budget = Duration::from_secs_f64(TASK_STOP_BUDGET_SECONDS)
                + self.shared.config.failover.tick();
            if timeout(budget, &mut handle).await.is_err() {
                warn!("Failover loop did not stop in time, aborting");
                handle.abort();
            }
        }

        for adapter in self.shared.adapters_snapshot() {
            adapter.stop().await;
        }

        *self.shared.active.lock().unwrap() = None;
        self.shared.events.publish(IngestEvent::PipelineStopped {
            timestamp: Utc::now(),
        });
        info!("Source manager stopped");
    }

    /// Drain exactly `n` samples from the master buffer, or `None` on
    /// underflow. Non-blocking; this is the consumer contract for the
    /// downstream SAME decoder, which treats `None` as "no new samples
    /// this tick".
    pub fn read_audio(&self, n: usize) -> Option<Vec<f32>> {
        self.shared.master_consumer.lock().unwrap().read(n)
    }

    /// Name of the currently active source, if any.
    pub fn active_source(&self) -> Option<String> {
        self.shared.active_name()
    }

    /// Metrics for one source.
    pub fn get_source_metrics(&self, name: &str) -> Option<SourceMetrics> {
        self.shared
            .adapters
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.metrics())
    }

    /// Metrics for every source.
    pub fn get_all_metrics(&self) -> HashMap<String, SourceMetrics> {
        self.shared
            .adapters
            .lock()
            .unwrap()
            .iter()
            .map(|a| (a.name().to_string(), a.metrics()))
            .collect()
    }

    /// Up to `limit` most recent failover events, oldest first.
    pub fn get_failover_history(&self, limit: usize) -> Vec<FailoverEvent> {
        self.shared.recent_history(limit)
    }

    /// Register the failover callback. Replaces any previous one.
    pub fn set_failover_callback(&self, callback: FailoverCallback) {
        *self.shared.failover_cb.lock().unwrap() = Some(callback);
    }

    /// Subscribe to the pipeline event stream.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<IngestEvent> {
        self.shared.events.subscribe()
    }

    /// Passive health query surface backed by this manager.
    pub fn health_reporter(&self) -> HealthReporter {
        HealthReporter::new(Arc::clone(&self.shared))
    }

    /// Add a source; takes effect at the next failover iteration.
    pub fn add_source(&self, source: SourceConfig) -> Result<()> {
        source.validate()?;

        let mut adapters = self.shared.adapters.lock().unwrap();
        if adapters.iter().any(|a| a.name() == source.name) {
            return Err(Error::Config(format!(
                "duplicate source name '{}'",
                source.name
            )));
        }

        let enabled = source.enabled;
        let adapter = Arc::new(SourceAdapter::new(
            source,
            self.shared.config.sample_rate,
            self.shared.config.source_buffer_samples(),
            self.shared.config.failover.healthy_reset(),
            self.shared.events.clone(),
        )?);

        if self.shared.running.load(Ordering::Acquire) && enabled {
            adapter.start()?;
        }
        adapters.push(adapter);
        Ok(())
    }

    /// Remove a source; if it was active, the next iteration fails over.
    pub async fn remove_source(&self, name: &str) -> Result<()> {
        let adapter = {
            let mut adapters = self.shared.adapters.lock().unwrap();
            let idx = adapters
                .iter()
                .position(|a| a.name() == name)
                .ok_or_else(|| Error::Config(format!("unknown source '{}'", name)))?;
            adapters.remove(idx)
        };
        adapter.stop().await;
        Ok(())
    }

    /// Enable or disable a source. Disabling stops its decoder; enabling
    /// restarts it fresh (which also resets a `GivingUp` source).
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let adapter = self
            .shared
            .adapters
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown source '{}'", name)))?;

        adapter.set_enabled_flag(enabled);
        if enabled {
            if self.shared.running.load(Ordering::Acquire) {
                adapter.stop().await;
                adapter.start()?;
            }
        } else {
            adapter.stop().await;
        }
        Ok(())
    }

    /// Administrative failover to a named source, or to the next serving
    /// candidate when `target` is [`FAILOVER_NEXT`]. Applied at the next
    /// iteration; recorded with reason `manual`.
    pub fn force_failover(&self, target: &str) -> Result<()> {
        if target != FAILOVER_NEXT {
            let adapters = self.shared.adapters.lock().unwrap();
            let adapter = adapters
                .iter()
                .find(|a| a.name() == target)
                .ok_or_else(|| Error::Config(format!("unknown source '{}'", target)))?;
            if !adapter.is_enabled() {
                return Err(Error::Config(format!("source '{}' is disabled", target)));
            }
        }
        *self.shared.manual_request.lock().unwrap() = Some(target.to_string());
        Ok(())
    }
}

/// First enabled serving adapter in (priority, configuration order).
fn select_best(adapters: &[Arc<SourceAdapter>]) -> Option<Arc<SourceAdapter>> {
    let mut best: Option<&Arc<SourceAdapter>> = None;
    for adapter in adapters {
        if !adapter.is_enabled() || !adapter.health().is_serving() {
            continue;
        }
        match best {
            Some(b) if adapter.priority() >= b.priority() => {}
            _ => best = Some(adapter),
        }
    }
    best.cloned()
}

/// Serving adapter after `current` in (priority, configuration order),
/// wrapping around; first serving adapter when `current` is absent.
fn next_serving_after(
    adapters: &[Arc<SourceAdapter>],
    current: Option<&str>,
) -> Option<String> {
    let mut serving: Vec<&Arc<SourceAdapter>> = adapters
        .iter()
        .enumerate()
        .filter(|(_, a)| a.is_enabled() && a.health().is_serving())
        .map(|(_, a)| a)
        .collect();
    serving.sort_by_key(|a| a.priority());
    if serving.is_empty() {
        return None;
    }

    let pos = current.and_then(|name| serving.iter().position(|a| a.name() == name));
    let next = match pos {
        Some(idx) => serving[(idx + 1) % serving.len()],
        None => serving[0],
    };
    Some(next.name().to_string())
}

/// The failover loop: selection, preemption, stall handling, and the
/// bounded real-time pump into the master buffer.
async fn failover_loop(shared: Arc<ManagerShared>, mut master: SampleProducer) {
    let tick = shared.config.failover.tick();
    let stall_window = shared.config.failover.stall_window();
    let hysteresis = shared.config.failover.preempt_hysteresis();
    // At most 200 ms of audio per iteration: twice real time at the
    // default cadence, so backlogs converge without starving other tasks
    let max_pump = (shared.config.sample_rate as usize / 5).max(1);

    let mut stall_since: Option<Instant> = None;

    loop {
        sleep(tick).await;
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }

        let adapters = shared.adapters_snapshot();
        let manual = shared.manual_request.lock().unwrap().take();
        let current_name = shared.active_name();
        let current = current_name
            .as_deref()
            .and_then(|name| adapters.iter().find(|a| a.name() == name).cloned());
        let best = select_best(&adapters);

        // (new active, reason, note); None = no change this iteration
        let mut decision: Option<(Option<String>, FailoverReason, Option<String>)> = None;

        if let Some(target) = manual {
            let resolved = if target == FAILOVER_NEXT {
                next_serving_after(&adapters, current_name.as_deref())
            } else {
                adapters
                    .iter()
                    .find(|a| a.name() == target)
                    .map(|a| a.name().to_string())
            };
            match resolved {
                Some(name) if current_name.as_deref() != Some(name.as_str()) => {
                    decision = Some((Some(name), FailoverReason::Manual, None));
                }
                Some(_) => {}
                None => debug!("Manual failover target '{}' not available", target),
            }
        }

        if decision.is_none() {
            match (&current_name, &current) {
                (None, _) => {
                    if let Some(b) = &best {
                        let (reason, note) = if shared.ever_activated.load(Ordering::Relaxed) {
                            (
                                FailoverReason::HigherPriorityRecovered,
                                Some("source recovered".to_string()),
                            )
                        } else {
                            (FailoverReason::Initial, None)
                        };
                        decision = Some((Some(b.name().to_string()), reason, note));
                    }
                }
                (Some(name), None) => {
                    // Active source was removed out from under us
                    decision = Some((
                        best.as_ref().map(|b| b.name().to_string()),
                        FailoverReason::Manual,
                        Some(format!("source '{}' removed", name)),
                    ));
                }
                (Some(name), Some(cur)) => {
                    let health = cur.health();
                    if health.is_serving() {
                        // Degraded and producing nothing: after the stall
                        // window, prefer any other serving source
                        if health == SourceHealth::Degraded && cur.available() == 0 {
                            let since = *stall_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= stall_window {
                                if let Some(b) = &best {
                                    if b.name() != name.as_str() {
                                        decision = Some((
                                            Some(b.name().to_string()),
                                            FailoverReason::WatchdogTimeout,
                                            Some("output stalled".to_string()),
                                        ));
                                    }
                                }
                            }
                        } else {
                            stall_since = None;
                        }

                        // Preemption by a recovered higher-priority source
                        if decision.is_none() {
                            if let Some(b) = &best {
                                if b.name() != name.as_str()
                                    && b.priority() < cur.priority()
                                    && b.health() == SourceHealth::Healthy
                                    && b.healthy_streak() >= hysteresis
                                {
                                    decision = Some((
                                        Some(b.name().to_string()),
                                        FailoverReason::HigherPriorityRecovered,
                                        None,
                                    ));
                                }
                            }
                        }
                    } else {
                        match health {
                            SourceHealth::Failed | SourceHealth::Starting => {
                                // Transient outage: switch only when a
                                // replacement exists; a lone source keeps
                                // the active role while it restarts
                                if let Some(b) = &best {
                                    if b.name() != name.as_str() {
                                        decision = Some((
                                            Some(b.name().to_string()),
                                            cur.last_failure_reason(),
                                            None,
                                        ));
                                    }
                                }
                            }
                            SourceHealth::GivingUp | SourceHealth::Stopped => {
                                let (reason, note) = if health == SourceHealth::GivingUp {
                                    (
                                        cur.last_failure_reason(),
                                        Some(format!(
                                            "source '{}' gave up after {} attempts",
                                            name,
                                            cur.metrics().restart_count
                                        )),
                                    )
                                } else {
                                    (
                                        FailoverReason::Manual,
                                        Some(format!("source '{}' stopped", name)),
                                    )
                                };
                                decision = Some((
                                    best.as_ref().map(|b| b.name().to_string()),
                                    reason,
                                    note,
                                ));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        if let Some((new_active, reason, note)) = decision {
            if new_active != current_name {
                stall_since = None;
                shared.emit_failover(current_name, new_active.clone(), reason, note);
                // The pointer moves before any sample from the new source
                // reaches the master buffer, so a consumer that observes
                // the cut sees the new identity
                *shared.active.lock().unwrap() = new_active;
            }
        }

        // Pump from the active source into the master buffer
        let active = shared
            .active_name()
            .and_then(|name| adapters.iter().find(|a| a.name() == name).cloned());
        if let Some(adapter) = active {
            let n = master.free().min(adapter.available()).min(max_pump);
            if n > 0 {
                if let Some(samples) = adapter.read_samples(n) {
                    master.write(&samples);
                }
            }
        }
    }

    debug!("Failover loop exiting");
}
