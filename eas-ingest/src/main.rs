//! # EAS Station Audio Ingest (eas-ingest)
//!
//! 24/7 ingest daemon: pulls audio from the configured sources through
//! supervised decoder subprocesses, runs priority failover, and writes the
//! resulting PCM16LE mono stream to stdout for the downstream SAME
//! decoder. Health snapshots are logged periodically; all logging goes to
//! stderr so the sample stream stays clean.

use anyhow::Result;
use clap::Parser;
use eas_ingest::config::IngestConfig;
use eas_ingest::ingest::SourceManager;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "eas-ingest")]
#[command(about = "EAS Station audio ingest - priority failover PCM pipeline")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "eas-ingest.toml")]
    config: PathBuf,

    /// Pipeline sample rate in Hz (overrides config file)
    #[arg(short = 'r', long)]
    sample_rate: Option<u32>,

    /// Seconds between health snapshot log lines (0 disables)
    #[arg(long, default_value_t = 10)]
    health_period: u64,

    /// Suppress the PCM stream on stdout (health/metrics only)
    #[arg(long)]
    no_audio_out: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging (stderr: stdout carries PCM)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eas_ingest=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting EAS Station audio ingest (eas-ingest)");

    let args = Args::parse();
    info!("Configuration file: {:?}", args.config);

    let config = IngestConfig::load(&args.config, args.sample_rate).await?;
    info!(
        "Loaded configuration: rate={} Hz, sources={}, master_buffer={:.1}s",
        config.sample_rate,
        config.sources.len(),
        config.master_buffer_seconds
    );
    if config.sources.is_empty() {
        warn!("No sources configured; the pipeline will only ever underflow");
    }

    let sample_rate = config.sample_rate;
    let manager = SourceManager::new(config)?;
    let reporter = manager.health_reporter();

    manager.start()?;
    info!("Source manager started");

    // Consumer cadence: every 100 ms ask for 100 ms of samples
    let chunk = (sample_rate as usize / 10).max(1);
    let mut drain_tick = tokio::time::interval(Duration::from_millis(100));
    drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let health_period = if args.health_period == 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_secs(args.health_period)
    };
    let mut health_tick = tokio::time::interval(health_period);
    health_tick.tick().await; // skip the immediate first firing

    let mut stdout = tokio::io::stdout();
    let mut pcm_out = Vec::with_capacity(chunk * 2);

    loop {
        tokio::select! {
            _ = drain_tick.tick() => {
                // None means no samples right now: keep the cadence, never
                // fabricate silence to mask an outage
                if let Some(samples) = manager.read_audio(chunk) {
                    if !args.no_audio_out {
                        pcm_out.clear();
                        for sample in &samples {
                            let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                            pcm_out.extend_from_slice(&value.to_le_bytes());
                        }
                        if let Err(e) = stdout.write_all(&pcm_out).await {
                            error!("Failed to write PCM to stdout: {}", e);
                            break;
                        }
                    }
                }
            }
            _ = health_tick.tick() => {
                if args.health_period != 0 {
                    let snapshot = reporter.snapshot();
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => info!(target: "eas_ingest::health", "{}", json),
                        Err(e) => warn!("Failed to serialize health snapshot: {}", e),
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.stop().await;
    info!("EAS Station audio ingest shutting down");
    Ok(())
}
