//! Lock-free SPSC ring buffer for float32 sample handoff
//!
//! Each source adapter owns one ring between its producer task (decoder
//! PCM → samples) and the manager's pump; a second ring of the same kind is
//! the master buffer between the pump and the consumer API.
//!
//! ## Design
//!
//! ```text
//! Decoder subprocess → producer task → SampleProducer::write()
//!                                            ↓
//!                                    ring (HeapRb<f32>)
//!                                            ↓
//!                                   SampleConsumer::read()
//!                                            ↓
//!                                     failover pump / SAME decoder
//! ```
//!
//! The ring is split at construction into a producer half and a consumer
//! half that are moved to their respective tasks, so the single-producer /
//! single-consumer invariant is a type-level property. The `ringbuf` crate
//! provides the wait-free FIFO with acquire/release index publication;
//! this module layers the back-pressure accounting on top:
//!
//! - A refused write is not an error: the short count comes back and
//!   `overruns` grows by the number of refused samples.
//! - A read of more samples than are buffered returns `None` and grows
//!   `underruns` by the full request.
//!
//! Accounting counters use relaxed ordering (statistics only, exact
//! instantaneous value not critical). Capacity is rounded up to a power of
//! two so index arithmetic stays a bitmask.

use eas_common::metrics::BufferStats;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Hard cap on ring capacity in samples (~12.7 minutes at 22050 Hz).
pub const MAX_RING_CAPACITY: usize = 1 << 24;

/// Shared accounting for one ring, readable from either half or from a
/// cloned handle held by the health reporter.
#[derive(Debug)]
pub struct RingMetrics {
    capacity: usize,
    fill: AtomicUsize,
    overruns: AtomicU64,
    underruns: AtomicU64,
    peak_fill: AtomicUsize,
}

impl RingMetrics {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            fill: AtomicUsize::new(0),
            overruns: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            peak_fill: AtomicUsize::new(0),
        }
    }

    /// Ring capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples refused at the producer side since creation.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Samples requested but unavailable at the consumer side.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Fill as a fraction of capacity. Statistics-grade estimate.
    pub fn fill_fraction(&self) -> f32 {
        let fill = self.fill.load(Ordering::Relaxed).min(self.capacity);
        fill as f32 / self.capacity as f32
    }

    /// Current accounting snapshot.
    pub fn snapshot(&self) -> BufferStats {
        BufferStats {
            capacity: self.capacity,
            fill: self.fill.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            peak_fill: self.peak_fill.load(Ordering::Relaxed),
        }
    }

    fn record_fill(&self, occupied: usize) {
        self.fill.store(occupied, Ordering::Relaxed);
        self.peak_fill.fetch_max(occupied, Ordering::Relaxed);
    }
}

/// Sample ring constructor; the ring itself only ever exists as its two
/// halves.
pub struct SampleRing;

impl SampleRing {
    /// Create a ring of at least `capacity` samples, rounded up to the next
    /// power of two, and split it into its producer and consumer halves.
    ///
    /// Fails with `InvalidCapacity` for zero or anything that would round
    /// beyond [`MAX_RING_CAPACITY`].
    pub fn with_capacity(capacity: usize) -> Result<(SampleProducer, SampleConsumer)> {
        if capacity == 0 || capacity > MAX_RING_CAPACITY {
            return Err(Error::InvalidCapacity {
                requested: capacity,
                max: MAX_RING_CAPACITY,
            });
        }
        let rounded = capacity.next_power_of_two();
        if rounded > MAX_RING_CAPACITY {
            return Err(Error::InvalidCapacity {
                requested: capacity,
                max: MAX_RING_CAPACITY,
            });
        }

        let rb = HeapRb::<f32>::new(rounded);
        let (prod, cons) = rb.split();
        let metrics = Arc::new(RingMetrics::new(rounded));

        Ok((
            SampleProducer {
                prod,
                metrics: Arc::clone(&metrics),
            },
            SampleConsumer { cons, metrics },
        ))
    }
}

/// Producer half: owned by exactly one task for the ring's lifetime.
pub struct SampleProducer {
    prod: HeapProd<f32>,
    metrics: Arc<RingMetrics>,
}

impl SampleProducer {
    /// Write as many of `samples` as fit, in order. Returns the count
    /// actually written; refused samples are counted as overruns.
    ///
    /// Never blocks, never allocates, never yields.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let written = self.prod.push_slice(samples);
        let refused = samples.len() - written;
        if refused > 0 {
            self.metrics
                .overruns
                .fetch_add(refused as u64, Ordering::Relaxed);
        }
        self.metrics.record_fill(self.prod.occupied_len());
        written
    }

    /// Samples currently buffered (lower-bound estimate from this side).
    pub fn available(&self) -> usize {
        self.prod.occupied_len()
    }

    /// Free space in samples (lower-bound estimate from this side).
    pub fn free(&self) -> usize {
        self.prod.vacant_len()
    }

    /// Shared accounting handle.
    pub fn metrics(&self) -> Arc<RingMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current accounting snapshot.
    pub fn stats(&self) -> BufferStats {
        self.metrics.snapshot()
    }
}

/// Consumer half: owned by exactly one task for the ring's lifetime.
pub struct SampleConsumer {
    cons: HeapCons<f32>,
    metrics: Arc<RingMetrics>,
}

impl SampleConsumer {
    /// Read exactly `n` samples in FIFO order, or `None` when fewer are
    /// buffered (counting `n` underruns).
    ///
    /// Never blocks; safe on the consumer critical path.
    pub fn read(&mut self, n: usize) -> Option<Vec<f32>> {
        if self.cons.occupied_len() < n {
            self.metrics.underruns.fetch_add(n as u64, Ordering::Relaxed);
            return None;
        }
        let mut out = vec![0.0f32; n];
        let got = self.cons.pop_slice(&mut out);
        // SPSC: occupancy observed from the consumer side can only have
        // grown since the check above.
        debug_assert_eq!(got, n);
        self.metrics.record_fill(self.cons.occupied_len());
        Some(out)
    }

    /// Blocking variant for callers off the real-time path (tests, offline
    /// consumers). Sleep-polls until `n` samples are buffered or `max_wait`
    /// elapses; the live pipeline never uses this.
    pub fn read_blocking(&mut self, n: usize, max_wait: Duration) -> Option<Vec<f32>> {
        let deadline = Instant::now() + max_wait;
        while self.cons.occupied_len() < n {
            if Instant::now() >= deadline {
                self.metrics.underruns.fetch_add(n as u64, Ordering::Relaxed);
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut out = vec![0.0f32; n];
        let got = self.cons.pop_slice(&mut out);
        debug_assert_eq!(got, n);
        self.metrics.record_fill(self.cons.occupied_len());
        Some(out)
    }

    /// Discard everything currently buffered. Returns the discarded count.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.cons.try_pop().is_some() {
            drained += 1;
        }
        self.metrics.record_fill(0);
        drained
    }

    /// Samples currently buffered (lower-bound estimate).
    pub fn available(&self) -> usize {
        self.cons.occupied_len()
    }

    /// Fill as a fraction of capacity in `[0.0, 1.0]`.
    pub fn fill_fraction(&self) -> f32 {
        self.cons.occupied_len() as f32 / self.metrics.capacity as f32
    }

    /// Shared accounting handle.
    pub fn metrics(&self) -> Arc<RingMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current accounting snapshot.
    pub fn stats(&self) -> BufferStats {
        self.metrics.snapshot()
    }
}
