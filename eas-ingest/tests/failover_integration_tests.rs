//! End-to-end failover scenarios against real stub subprocesses
//!
//! Each test builds a stub decoder script, runs the full pipeline
//! (subprocess → adapter ring → failover pump → master buffer → consumer
//! API), and asserts the externally observable behavior: active source,
//! failover history, health metrics, and the consumer stream.

#![cfg(unix)]

mod helpers;

use eas_common::events::{FailoverReason, SourceHealth};
use eas_ingest::ingest::SourceManager;
use helpers::*;
use std::time::Duration;

#[tokio::test]
async fn test_clean_single_source() {
    let dir = tempfile::tempdir().unwrap();
    let pcm = dir.path().join("loud.raw");
    write_loud_pcm(&pcm, 0.5);
    let stub = streaming_stub(dir.path(), "dec-s.sh", &pcm);

    let manager = SourceManager::new(test_config(vec![test_source("s", 10, &stub)])).unwrap();
    manager.start().unwrap();

    // The source comes up and audio reaches the consumer API
    assert!(
        wait_for(Duration::from_secs(5), || manager
            .read_audio(TEST_RATE as usize / 10)
            .is_some())
        .await,
        "no audio reached the master buffer"
    );

    assert_eq!(manager.active_source().as_deref(), Some("s"));

    let history = manager.get_failover_history(16);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, FailoverReason::Initial);
    assert_eq!(history[0].from, None);
    assert_eq!(history[0].to.as_deref(), Some("s"));

    let metrics = manager.get_source_metrics("s").unwrap();
    assert!(metrics.health.is_serving(), "got {:?}", metrics.health);
    assert_eq!(metrics.restart_count, 0);
    assert!(metrics.peak_dbfs > -50.0);

    // Exactly-n contract
    let chunk = manager.read_audio(2205);
    if let Some(samples) = chunk {
        assert_eq!(samples.len(), 2205);
    }

    manager.stop().await;
    assert!(manager.active_source().is_none());
}

#[tokio::test]
async fn test_crash_triggers_restart_without_failover_event() {
    let dir = tempfile::tempdir().unwrap();
    let pcm = dir.path().join("loud.raw");
    write_loud_pcm(&pcm, 0.5);
    let stub = crashing_stub(dir.path(), "dec-crash.sh", &pcm);

    let manager = SourceManager::new(test_config(vec![test_source("s", 10, &stub)])).unwrap();
    manager.start().unwrap();

    // The decoder exits after one chunk; the adapter must notice and
    // restart it under backoff
    assert!(
        wait_for(Duration::from_secs(5), || {
            let m = manager.get_source_metrics("s").unwrap();
            m.restart_count >= 1
        })
        .await,
        "source never restarted"
    );

    // And come back to serving after the restart
    assert!(
        wait_for(Duration::from_secs(5), || {
            manager
                .get_source_metrics("s")
                .unwrap()
                .health
                .is_serving()
        })
        .await,
        "source never recovered after restart"
    );

    // The active identity never changed: only the initial event exists
    let history = manager.get_failover_history(16);
    assert_eq!(history.len(), 1, "unexpected events: {:?}", history);
    assert_eq!(history[0].reason, FailoverReason::Initial);
    assert_eq!(manager.active_source().as_deref(), Some("s"));

    manager.stop().await;
}

#[tokio::test]
async fn test_failover_on_silence() {
    let dir = tempfile::tempdir().unwrap();
    let silent = dir.path().join("silent.raw");
    let loud = dir.path().join("loud.raw");
    write_silent_pcm(&silent, 0.5);
    write_loud_pcm(&loud, 0.5);

    let stub1 = streaming_stub(dir.path(), "dec-s1.sh", &silent);
    let stub2 = streaming_stub(dir.path(), "dec-s2.sh", &loud);

    let mut s1 = test_source("s1", 10, &stub1);
    s1.silence_duration_seconds = 1.0;
    let s2 = test_source("s2", 20, &stub2);

    let manager = SourceManager::new(test_config(vec![s1, s2])).unwrap();
    manager.start().unwrap();

    // S1 (higher priority) activates first, then its sustained silence
    // fails it over to S2
    assert!(
        wait_for(Duration::from_secs(6), || manager
            .active_source()
            .as_deref()
            == Some("s2"))
        .await,
        "never failed over to s2"
    );

    let history = manager.get_failover_history(16);
    let cut = history
        .iter()
        .find(|e| e.to.as_deref() == Some("s2"))
        .expect("missing failover event to s2");
    assert_eq!(cut.from.as_deref(), Some("s1"));
    assert_eq!(cut.reason, FailoverReason::Silence);

    // The consumer stream keeps flowing from the backup
    assert!(
        wait_for(Duration::from_secs(3), || manager
            .read_audio(TEST_RATE as usize / 10)
            .is_some())
        .await
    );

    manager.stop().await;
}

#[tokio::test]
async fn test_higher_priority_recovery_preempts() {
    let dir = tempfile::tempdir().unwrap();
    let loud = dir.path().join("loud.raw");
    write_loud_pcm(&loud, 0.5);

    // S1 (preferred) needs 1.5 s to come online; S2 streams immediately
    let stub1 = delayed_stub(dir.path(), "dec-s1.sh", &loud, 1.5);
    let stub2 = streaming_stub(dir.path(), "dec-s2.sh", &loud);

    let manager = SourceManager::new(test_config(vec![
        test_source("s1", 10, &stub1),
        test_source("s2", 20, &stub2),
    ]))
    .unwrap();
    manager.start().unwrap();

    // Initial activation goes to the only serving source: S2
    assert!(
        wait_for(Duration::from_secs(4), || manager
            .active_source()
            .as_deref()
            == Some("s2"))
        .await,
        "s2 never activated"
    );
    let history = manager.get_failover_history(16);
    assert_eq!(history[0].reason, FailoverReason::Initial);
    assert_eq!(history[0].to.as_deref(), Some("s2"));

    // Once S1 holds Healthy past the hysteresis window, it preempts
    assert!(
        wait_for(Duration::from_secs(8), || manager
            .active_source()
            .as_deref()
            == Some("s1"))
        .await,
        "s1 never preempted"
    );

    let history = manager.get_failover_history(16);
    let preempt = history
        .iter()
        .find(|e| e.to.as_deref() == Some("s1"))
        .expect("missing preemption event");
    assert_eq!(preempt.from.as_deref(), Some("s2"));
    assert_eq!(preempt.reason, FailoverReason::HigherPriorityRecovered);

    manager.stop().await;
}

#[tokio::test]
async fn test_give_up_is_terminal() {
    let mut source = test_source("s", 10, std::path::Path::new("/nonexistent/decoder-xyz"));
    source.max_restart_attempts = 3;

    let manager = SourceManager::new(test_config(vec![source])).unwrap();
    manager.start().unwrap();

    // Backoff schedule for three attempts: 0.5 + 1 + 2 = 3.5 s, plus slack
    assert!(
        wait_for(Duration::from_secs(8), || {
            manager.get_source_metrics("s").unwrap().health == SourceHealth::GivingUp
        })
        .await,
        "source never gave up"
    );

    let metrics = manager.get_source_metrics("s").unwrap();
    assert_eq!(metrics.restart_count, 3);
    assert!(metrics.last_error.is_some());

    // Nothing is masked: the consumer sees underflow, not fabricated audio
    assert!(manager.read_audio(2205).is_none());
    assert!(manager.active_source().is_none());

    // Still terminal a little later: no further spawns, state unchanged
    tokio::time::sleep(Duration::from_millis(700)).await;
    let metrics = manager.get_source_metrics("s").unwrap();
    assert_eq!(metrics.health, SourceHealth::GivingUp);
    assert_eq!(metrics.restart_count, 3);

    manager.stop().await;
}

#[tokio::test]
async fn test_manual_failover() {
    let dir = tempfile::tempdir().unwrap();
    let loud = dir.path().join("loud.raw");
    write_loud_pcm(&loud, 0.5);

    let stub1 = streaming_stub(dir.path(), "dec-s1.sh", &loud);
    let stub2 = streaming_stub(dir.path(), "dec-s2.sh", &loud);

    let mut config = test_config(vec![
        test_source("s1", 10, &stub1),
        test_source("s2", 20, &stub2),
    ]);
    // Keep the automatic preemption from immediately undoing the override
    config.failover.preempt_hysteresis_seconds = 30.0;

    let manager = SourceManager::new(config).unwrap();
    manager.start().unwrap();

    assert!(
        wait_for(Duration::from_secs(4), || manager
            .active_source()
            .as_deref()
            == Some("s1"))
        .await
    );

    manager.force_failover("s2").unwrap();
    assert!(
        wait_for(Duration::from_secs(3), || manager
            .active_source()
            .as_deref()
            == Some("s2"))
        .await,
        "manual failover not applied"
    );

    let history = manager.get_failover_history(16);
    let manual = history.last().unwrap();
    assert_eq!(manual.reason, FailoverReason::Manual);
    assert_eq!(manual.from.as_deref(), Some("s1"));
    assert_eq!(manual.to.as_deref(), Some("s2"));

    manager.stop().await;
}

#[tokio::test]
async fn test_failover_callback_and_events() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let loud = dir.path().join("loud.raw");
    write_loud_pcm(&loud, 0.5);
    let stub = streaming_stub(dir.path(), "dec-s.sh", &loud);

    let manager = SourceManager::new(test_config(vec![test_source("s", 10, &stub)])).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    manager.set_failover_callback(Arc::new(move |_event| {
        calls_clone.fetch_add(1, Ordering::Relaxed);
    }));
    let mut events = manager.subscribe_events();

    manager.start().unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || calls.load(Ordering::Relaxed) >= 1).await,
        "failover callback never invoked"
    );

    // The broadcast bus carries the lifecycle and the cut
    let mut saw_failover = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(event)) => {
                if event.event_type() == "FailoverOccurred" {
                    saw_failover = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(saw_failover, "no FailoverOccurred event on the bus");

    manager.stop().await;
}

#[tokio::test]
async fn test_disable_active_source_fails_over() {
    let dir = tempfile::tempdir().unwrap();
    let loud = dir.path().join("loud.raw");
    write_loud_pcm(&loud, 0.5);

    let stub1 = streaming_stub(dir.path(), "dec-s1.sh", &loud);
    let stub2 = streaming_stub(dir.path(), "dec-s2.sh", &loud);

    let manager = SourceManager::new(test_config(vec![
        test_source("s1", 10, &stub1),
        test_source("s2", 20, &stub2),
    ]))
    .unwrap();
    manager.start().unwrap();

    assert!(
        wait_for(Duration::from_secs(4), || manager
            .active_source()
            .as_deref()
            == Some("s1"))
        .await
    );

    manager.set_enabled("s1", false).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(3), || manager
            .active_source()
            .as_deref()
            == Some("s2"))
        .await,
        "did not fail over off the disabled source"
    );
    assert_eq!(
        manager.get_source_metrics("s1").unwrap().health,
        SourceHealth::Stopped
    );

    manager.stop().await;
}
