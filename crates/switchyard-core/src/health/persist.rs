//! Snapshotting breaker state to disk so an open circuit survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackendHealth, CircuitState, HealthTracker};

/// File name of the snapshot inside the state directory.
pub const SNAPSHOT_FILE: &str = "circuit-breakers.json";

/// Serialize the non-closed records. Closed circuits carry nothing worth
/// restoring.
pub fn encode_snapshot(records: &BTreeMap<String, BackendHealth>) -> Result<String, serde_json::Error> {
    let open: BTreeMap<&String, &BackendHealth> = records
        .iter()
        .filter(|(_, h)| h.state != CircuitState::Closed)
        .collect();
    serde_json::to_string_pretty(&open)
}

/// Decide which persisted records still apply at `now_ms`.
///
/// Open records come back only while their cooldown is running. Half-open
/// records come back with their probe and success counters cleared.
pub fn decode_snapshot(content: &str, now_ms: i64, cooldown_ms: u64) -> HashMap<String, BackendHealth> {
    let parsed: HashMap<String, BackendHealth> = match serde_json::from_str(content) {
        Ok(p) => p,
        Err(e) => {
            warn!("Ignoring corrupt breaker snapshot: {}", e);
            return HashMap::new();
        }
    };
    let cooldown = i64::try_from(cooldown_ms).unwrap_or(i64::MAX);

    parsed
        .into_iter()
        .filter_map(|(id, mut h)| match h.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let last = h.last_failure?;
                if now_ms.saturating_sub(last) < cooldown {
                    h.half_open_probes_in_flight = 0;
                    Some((id, h))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                h.half_open_probes_in_flight = 0;
                h.successes = 0;
                Some((id, h))
            }
        })
        .collect()
}

/// Load a snapshot into `tracker`. A missing or unreadable file means no
/// prior state. Returns the number of records restored.
pub async fn load_snapshot(tracker: &HealthTracker, path: &Path) -> usize {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("Failed to read breaker snapshot {}: {}", path.display(), e);
            return 0;
        }
    };
    let cooldown = tracker.config().await.cooldown_ms;
    let records = decode_snapshot(&content, tracker.clock_ms(), cooldown);
    let count = records.len();
    tracker.restore(records).await;
    if count > 0 {
        info!("Restored {} circuit breaker(s) from {}", count, path.display());
    }
    count
}

/// Write `content` next to `path` and rename it into place.
pub async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Writes snapshots, skipping writes whose bytes match the previous one.
pub struct SnapshotWriter {
    tracker: Arc<HealthTracker>,
    path: PathBuf,
    last_written: Option<String>,
}

impl SnapshotWriter {
    pub fn new(tracker: Arc<HealthTracker>, path: PathBuf) -> Self {
        Self {
            tracker,
            path,
            last_written: None,
        }
    }

    /// Persist the current state. Returns whether a write happened.
    /// I/O errors are logged and swallowed.
    pub async fn flush(&mut self) -> bool {
        let snapshot = self.tracker.snapshot().await;
        let content = match encode_snapshot(&snapshot) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to encode breaker snapshot: {}", e);
                return false;
            }
        };
        if self.last_written.as_deref() == Some(content.as_str()) {
            return false;
        }
        match write_atomic(&self.path, &content).await {
            Ok(()) => {
                debug!("Wrote breaker snapshot to {}", self.path.display());
                self.last_written = Some(content);
                true
            }
            Err(e) => {
                warn!("Failed to write breaker snapshot {}: {}", self.path.display(), e);
                false
            }
        }
    }
}

/// Periodically persist `tracker` until `cancel` fires, then flush once more.
pub fn spawn_persistence(
    tracker: Arc<HealthTracker>,
    path: PathBuf,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = SnapshotWriter::new(tracker, path);
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    writer.flush().await;
                }
                _ = cancel.cancelled() => {
                    debug!("Breaker persistence shutting down");
                    writer.flush().await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::health::ManualClock;

    fn tracker() -> (Arc<HealthTracker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let cfg = ResilienceConfig {
            failure_threshold: 1,
            cooldown_ms: 10_000,
            ..Default::default()
        };
        (Arc::new(HealthTracker::with_clock(cfg, clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_closed_entries_not_persisted() {
        let (t, _) = tracker();
        t.record_success("ok").await;
        t.record_failure("down", "503").await;
        let content = encode_snapshot(&t.snapshot().await).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(parsed.get("ok").is_none());
        assert_eq!(parsed["down"]["state"], "open");
    }

    #[test]
    fn test_decode_filters_expired_and_resets_half_open() {
        let content = r#"{
            "fresh": {"state": "open", "failures": 5, "successes": 0, "lastFailure": 9000, "lastError": "x", "halfOpenProbesInFlight": 0},
            "stale": {"state": "open", "failures": 5, "successes": 0, "lastFailure": 1000, "lastError": "x", "halfOpenProbesInFlight": 0},
            "probing": {"state": "half_open", "failures": 5, "successes": 1, "lastFailure": 1000, "lastError": "x", "halfOpenProbesInFlight": 2},
            "fine": {"state": "closed", "failures": 0, "successes": 0, "lastFailure": null, "lastError": null, "halfOpenProbesInFlight": 0}
        }"#;
        let records = decode_snapshot(content, 12_000, 5_000);
        assert_eq!(records.len(), 2);
        assert!(records.contains_key("fresh"));
        let probing = &records["probing"];
        assert_eq!(probing.half_open_probes_in_flight, 0);
        assert_eq!(probing.successes, 0);
        assert_eq!(probing.failures, 5);
    }

    #[test]
    fn test_decode_corrupt() {
        assert!(decode_snapshot("{ nope", 0, 1).is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join(SNAPSHOT_FILE);

        let (t, clock) = tracker();
        t.record_failure("anthropic", "529 overloaded").await;
        let mut writer = SnapshotWriter::new(t.clone(), path.clone());
        assert!(writer.flush().await);
        // Unchanged state is not rewritten
        assert!(!writer.flush().await);

        let fresh = Arc::new(HealthTracker::with_clock(t.config().await, clock.clone()));
        assert_eq!(load_snapshot(&fresh, &path).await, 1);
        assert!(!fresh.can_use("anthropic").await);

        clock.advance(chrono::Duration::seconds(11));
        let later = HealthTracker::with_clock(t.config().await, clock.clone());
        assert_eq!(load_snapshot(&later, &path).await, 0);
        assert!(later.can_use("anthropic").await);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (t, _) = tracker();
        assert_eq!(load_snapshot(&t, &tmp.path().join("absent.json")).await, 0);
    }

    #[tokio::test]
    async fn test_write_error_swallowed() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail
        let path = tmp.path().join(SNAPSHOT_FILE);
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let (t, _) = tracker();
        t.record_failure("a", "x").await;
        let mut writer = SnapshotWriter::new(t, path);
        assert!(!writer.flush().await);
    }

    #[tokio::test]
    async fn test_spawn_persistence_flushes_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(SNAPSHOT_FILE);
        let (t, _) = tracker();
        let cancel = CancellationToken::new();
        let handle = spawn_persistence(t.clone(), path.clone(), Duration::from_secs(3600), cancel.clone());

        t.record_failure("google", "timeout").await;
        cancel.cancel();
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("google"));
    }
}
