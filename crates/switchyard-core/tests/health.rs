//! Breaker lifecycle and persistence across a simulated restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;

use switchyard_core::config::ResilienceConfig;
use switchyard_core::health::persist::{load_snapshot, spawn_persistence, SnapshotWriter, SNAPSHOT_FILE};
use switchyard_core::health::{Admission, CircuitState, HealthTracker, ManualClock};

fn config() -> ResilienceConfig {
    ResilienceConfig {
        failure_threshold: 3,
        success_threshold: 2,
        cooldown_ms: 10_000,
        half_open_concurrency_limit: 1,
        ..Default::default()
    }
}

fn tracker_at(clock: &Arc<ManualClock>) -> Arc<HealthTracker> {
    Arc::new(HealthTracker::with_clock(config(), clock.clone()))
}

#[tokio::test]
async fn test_full_breaker_lifecycle() {
    let clock = Arc::new(ManualClock::default());
    let tracker = tracker_at(&clock);

    for _ in 0..3 {
        assert_eq!(tracker.try_acquire("openai").await, Admission::Allowed);
        tracker.record_failure("openai", "503").await;
    }
    assert_eq!(tracker.health("openai").await.unwrap().state, CircuitState::Open);
    assert_eq!(tracker.try_acquire("openai").await, Admission::Blocked);

    clock.advance(ChronoDuration::seconds(11));
    assert_eq!(tracker.try_acquire("openai").await, Admission::Probe);
    // Only one probe at a time.
    assert_eq!(tracker.try_acquire("openai").await, Admission::Blocked);
    tracker.record_success("openai").await;

    assert_eq!(tracker.try_acquire("openai").await, Admission::Probe);
    tracker.record_success("openai").await;

    let h = tracker.health("openai").await.unwrap();
    assert_eq!(h.state, CircuitState::Closed);
    assert_eq!(h.failures, 0);
    assert_eq!(h.half_open_probes_in_flight, 0);
}

#[tokio::test]
async fn test_failed_probe_restarts_cooldown() {
    let clock = Arc::new(ManualClock::default());
    let tracker = tracker_at(&clock);
    for _ in 0..3 {
        tracker.record_failure("google", "500").await;
    }

    clock.advance(ChronoDuration::seconds(11));
    assert_eq!(tracker.try_acquire("google").await, Admission::Probe);
    tracker.record_failure("google", "still down").await;

    let h = tracker.health("google").await.unwrap();
    assert_eq!(h.state, CircuitState::Open);
    assert_eq!(h.half_open_probes_in_flight, 0);
    assert!(!tracker.can_use("google").await);

    clock.advance(ChronoDuration::seconds(5));
    assert!(!tracker.can_use("google").await);
    clock.advance(ChronoDuration::seconds(6));
    assert!(tracker.can_use("google").await);
}

#[tokio::test]
async fn test_open_circuit_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(SNAPSHOT_FILE);
    let clock = Arc::new(ManualClock::default());

    let before = tracker_at(&clock);
    for _ in 0..3 {
        before.record_failure("anthropic", "overloaded").await;
    }
    before.record_failure("openai", "timeout").await;
    let mut writer = SnapshotWriter::new(before.clone(), path.clone());
    assert!(writer.flush().await);
    // Unchanged state is not rewritten.
    assert!(!writer.flush().await);

    clock.advance(ChronoDuration::seconds(3));
    let after = tracker_at(&clock);
    assert_eq!(load_snapshot(&after, &path).await, 1);

    let h = after.health("anthropic").await.unwrap();
    assert_eq!(h.state, CircuitState::Open);
    assert_eq!(h.last_error.as_deref(), Some("overloaded"));
    assert!(!after.can_use("anthropic").await);
    // Closed circuits are not persisted.
    assert!(after.health("openai").await.is_none());
}

#[tokio::test]
async fn test_expired_open_circuit_is_not_restored() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(SNAPSHOT_FILE);
    let clock = Arc::new(ManualClock::default());

    let before = tracker_at(&clock);
    for _ in 0..3 {
        before.record_failure("anthropic", "overloaded").await;
    }
    SnapshotWriter::new(before, path.clone()).flush().await;

    clock.advance(ChronoDuration::seconds(60));
    let after = tracker_at(&clock);
    assert_eq!(load_snapshot(&after, &path).await, 0);
    assert!(after.can_use("anthropic").await);
}

#[tokio::test]
async fn test_missing_and_corrupt_snapshots_start_clean() {
    let tmp = tempfile::tempdir().unwrap();
    let tracker = HealthTracker::new(config());

    assert_eq!(load_snapshot(&tracker, &tmp.path().join("absent.json")).await, 0);

    let corrupt = tmp.path().join(SNAPSHOT_FILE);
    std::fs::write(&corrupt, "{ not json").unwrap();
    assert_eq!(load_snapshot(&tracker, &corrupt).await, 0);
    assert!(tracker.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_background_persistence_flushes_on_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("state").join(SNAPSHOT_FILE);
    let tracker = Arc::new(HealthTracker::new(config()));
    let cancel = CancellationToken::new();

    let handle = spawn_persistence(tracker.clone(), path.clone(), Duration::from_secs(3600), cancel.clone());
    for _ in 0..3 {
        tracker.record_failure("xai", "502").await;
    }
    cancel.cancel();
    handle.await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(parsed["xai"]["state"], "open");
    assert_eq!(parsed["xai"]["failures"], 3);
    assert!(parsed["xai"]["lastFailure"].is_i64());
}
