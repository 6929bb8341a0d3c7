//! # EAS Station Audio Ingest (eas-ingest)
//!
//! 24/7 audio ingest and failover core for an Emergency Alert System
//! station.
//!
//! **Purpose:** Pull compressed audio from remote sources (HTTP streams,
//! SDR wrappers, line inputs), decode to uniform PCM via supervised decoder
//! subprocesses, and present a single never-stalling float32 sample stream
//! to the downstream SAME/AFSK decoder.
//!
//! **Architecture:** per-source decoder subprocess + lock-free ring buffer,
//! watchdog-driven self-healing, priority-based failover into a master
//! output buffer.

pub mod config;
pub mod error;
pub mod ingest;

pub use config::{IngestConfig, SourceConfig};
pub use error::{Error, Result};
pub use ingest::{HealthReporter, SourceAdapter, SourceManager};
