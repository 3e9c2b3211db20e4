//! Per-backend circuit breakers.
//!
//! Each backend moves between `closed`, `open` and `half_open`. Every
//! public operation runs inside one async mutex, so concurrent requests
//! observe transitions in a single order.

pub mod persist;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use mockable::{Clock, DefaultClock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::util::truncate_string;

/// Longest error message kept on a record.
const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker record for one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    pub state: CircuitState,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub successes: u32,
    /// Epoch milliseconds of the most recent failure.
    #[serde(default)]
    pub last_failure: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub half_open_probes_in_flight: u32,
}

/// Outcome of asking to send a request to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed.
    Allowed,
    /// Half-open: the caller now holds a probe slot and must finish it with
    /// `record_success`, `record_failure` or `release_probe`.
    Probe,
    Blocked,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Blocked)
    }
}

struct TrackerState {
    records: HashMap<String, BackendHealth>,
    config: ResilienceConfig,
}

pub struct HealthTracker {
    state: Mutex<TrackerState>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl HealthTracker {
    pub fn new(config: ResilienceConfig) -> Self {
        Self::with_clock(config, Arc::new(DefaultClock))
    }

    pub fn with_clock(config: ResilienceConfig, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                records: HashMap::new(),
                config,
            }),
            clock,
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.utc().timestamp_millis()
    }

    /// Whether a request may go to `backend` now. An open circuit whose
    /// cooldown has elapsed moves to half-open here.
    pub async fn can_use(&self, backend: &str) -> bool {
        let now = self.now_ms();
        let mut guard = self.state.lock().await;
        admit(&mut guard, backend, now)
    }

    /// `can_use` and `start_half_open_probe` in one critical section.
    pub async fn try_acquire(&self, backend: &str) -> Admission {
        let now = self.now_ms();
        let mut guard = self.state.lock().await;
        if !admit(&mut guard, backend, now) {
            return Admission::Blocked;
        }
        let record = guard.records.entry(backend.to_string()).or_default();
        if record.state == CircuitState::HalfOpen {
            record.half_open_probes_in_flight += 1;
            Admission::Probe
        } else {
            Admission::Allowed
        }
    }

    pub async fn start_half_open_probe(&self, backend: &str) {
        let mut guard = self.state.lock().await;
        let record = guard.records.entry(backend.to_string()).or_default();
        record.half_open_probes_in_flight += 1;
    }

    /// Give back a probe slot without recording an outcome.
    pub async fn release_probe(&self, backend: &str) {
        let mut guard = self.state.lock().await;
        if let Some(record) = guard.records.get_mut(backend) {
            record.half_open_probes_in_flight = record.half_open_probes_in_flight.saturating_sub(1);
        }
    }

    pub async fn record_success(&self, backend: &str) {
        let mut guard = self.state.lock().await;
        let success_threshold = guard.config.success_threshold;
        let record = guard.records.entry(backend.to_string()).or_default();
        match record.state {
            CircuitState::Closed => {
                record.failures = 0;
            }
            CircuitState::HalfOpen => {
                record.half_open_probes_in_flight = record.half_open_probes_in_flight.saturating_sub(1);
                record.successes += 1;
                if record.successes >= success_threshold {
                    record.state = CircuitState::Closed;
                    record.failures = 0;
                    record.successes = 0;
                    record.half_open_probes_in_flight = 0;
                    info!("Circuit closed for {}", backend);
                }
            }
            CircuitState::Open => {
                warn!("Success recorded for {} while its circuit is open; ignoring", backend);
            }
        }
    }

    pub async fn record_failure(&self, backend: &str, error: &str) {
        let now = self.now_ms();
        let mut guard = self.state.lock().await;
        let failure_threshold = guard.config.failure_threshold;
        let record = guard.records.entry(backend.to_string()).or_default();
        record.last_failure = Some(now);
        record.last_error = Some(truncate_string(error, MAX_ERROR_LEN, "..."));
        match record.state {
            CircuitState::Closed => {
                record.failures += 1;
                if record.failures >= failure_threshold {
                    record.state = CircuitState::Open;
                    warn!("Circuit opened for {} after {} failures: {}", backend, record.failures, error);
                }
            }
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.failures += 1;
                record.successes = 0;
                record.half_open_probes_in_flight = 0;
                warn!("Half-open probe failed for {}, reopening: {}", backend, error);
            }
            CircuitState::Open => {
                record.failures += 1;
            }
        }
    }

    pub async fn health(&self, backend: &str) -> Option<BackendHealth> {
        self.state.lock().await.records.get(backend).cloned()
    }

    /// All records, ordered by backend id.
    pub async fn snapshot(&self) -> BTreeMap<String, BackendHealth> {
        let guard = self.state.lock().await;
        guard
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Forget one backend, or every backend when `backend` is `None`.
    pub async fn reset(&self, backend: Option<&str>) {
        let mut guard = self.state.lock().await;
        match backend {
            Some(id) => {
                guard.records.remove(id);
            }
            None => guard.records.clear(),
        }
    }

    /// Swap the thresholds used for future transitions. Existing records
    /// are left as they are.
    pub async fn update_config(&self, config: ResilienceConfig) {
        self.state.lock().await.config = config;
    }

    pub async fn config(&self) -> ResilienceConfig {
        self.state.lock().await.config.clone()
    }

    /// Install records loaded from a snapshot, keeping anything already
    /// tracked in this process.
    pub(crate) async fn restore(&self, records: HashMap<String, BackendHealth>) {
        let mut guard = self.state.lock().await;
        for (id, record) in records {
            guard.records.entry(id).or_insert(record);
        }
    }

    pub(crate) fn clock_ms(&self) -> i64 {
        self.now_ms()
    }
}

fn admit(state: &mut TrackerState, backend: &str, now: i64) -> bool {
    let cooldown = i64::try_from(state.config.cooldown_ms).unwrap_or(i64::MAX);
    let limit = state.config.half_open_concurrency_limit;
    let record = state.records.entry(backend.to_string()).or_default();
    match record.state {
        CircuitState::Closed => true,
        CircuitState::Open => {
            let since = now.saturating_sub(record.last_failure.unwrap_or(0));
            if since < cooldown {
                return false;
            }
            record.state = CircuitState::HalfOpen;
            record.successes = 0;
            record.half_open_probes_in_flight = 0;
            info!("Circuit half-open for {} after {}ms cooldown", backend, since);
            record.half_open_probes_in_flight < limit
        }
        CircuitState::HalfOpen => {
            let ok = record.half_open_probes_in_flight < limit;
            if !ok {
                debug!("No probe slot free for {}", backend);
            }
            ok
        }
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown_ms: 1_000,
            half_open_concurrency_limit: 1,
            ..Default::default()
        }
    }

    fn tracker() -> (HealthTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (HealthTracker::with_clock(config(), clock.clone()), clock)
    }

    async fn open(t: &HealthTracker, backend: &str) {
        for _ in 0..3 {
            t.record_failure(backend, "boom").await;
        }
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let (t, _) = tracker();
        t.record_failure("a", "x").await;
        t.record_failure("a", "x").await;
        t.record_success("a").await;
        let h = t.health("a").await.unwrap();
        assert_eq!(h.failures, 0);
        assert_eq!(h.state, CircuitState::Closed);
        assert_eq!(h.last_error.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_long_error_truncated() {
        let (t, _) = tracker();
        t.record_failure("a", &"e".repeat(2_000)).await;
        let err = t.health("a").await.unwrap().last_error.unwrap();
        assert_eq!(err.len(), MAX_ERROR_LEN);
        assert!(err.ends_with("..."));
    }

    #[tokio::test]
    async fn test_threshold_opens_circuit() {
        let (t, _) = tracker();
        t.record_failure("a", "x").await;
        t.record_failure("a", "x").await;
        assert!(t.can_use("a").await);
        t.record_failure("a", "x").await;
        assert_eq!(t.health("a").await.unwrap().state, CircuitState::Open);
        assert!(!t.can_use("a").await);
        // Other backends unaffected
        assert!(t.can_use("b").await);
    }

    #[tokio::test]
    async fn test_cooldown_then_single_probe() {
        let (t, clock) = tracker();
        open(&t, "a").await;
        clock.advance(chrono::Duration::milliseconds(999));
        assert_eq!(t.try_acquire("a").await, Admission::Blocked);

        clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(t.try_acquire("a").await, Admission::Probe);
        assert_eq!(t.health("a").await.unwrap().state, CircuitState::HalfOpen);
        // Limit of one probe
        assert_eq!(t.try_acquire("a").await, Admission::Blocked);
        assert!(!t.can_use("a").await);

        t.release_probe("a").await;
        assert!(t.can_use("a").await);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_success_threshold() {
        let (t, clock) = tracker();
        open(&t, "a").await;
        clock.advance(chrono::Duration::seconds(2));

        assert_eq!(t.try_acquire("a").await, Admission::Probe);
        t.record_success("a").await;
        let h = t.health("a").await.unwrap();
        assert_eq!(h.state, CircuitState::HalfOpen);
        assert_eq!(h.successes, 1);
        assert_eq!(h.half_open_probes_in_flight, 0);

        assert_eq!(t.try_acquire("a").await, Admission::Probe);
        t.record_success("a").await;
        let h = t.health("a").await.unwrap();
        assert_eq!(h.state, CircuitState::Closed);
        assert_eq!((h.failures, h.successes, h.half_open_probes_in_flight), (0, 0, 0));
        assert_eq!(t.try_acquire("a").await, Admission::Allowed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (t, clock) = tracker();
        open(&t, "a").await;
        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(t.try_acquire("a").await, Admission::Probe);
        t.record_failure("a", "still down").await;

        let h = t.health("a").await.unwrap();
        assert_eq!(h.state, CircuitState::Open);
        assert_eq!(h.half_open_probes_in_flight, 0);
        assert_eq!(h.last_error.as_deref(), Some("still down"));
        // Fresh cooldown from the new failure
        assert!(!t.can_use("a").await);
        clock.advance(chrono::Duration::seconds(1));
        assert!(t.can_use("a").await);
    }

    #[tokio::test]
    async fn test_success_while_open_ignored() {
        let (t, _) = tracker();
        open(&t, "a").await;
        t.record_success("a").await;
        let h = t.health("a").await.unwrap();
        assert_eq!(h.state, CircuitState::Open);
        assert_eq!(h.failures, 3);
    }

    #[tokio::test]
    async fn test_release_probe_never_negative() {
        let (t, _) = tracker();
        t.release_probe("a").await;
        t.start_half_open_probe("a").await;
        t.release_probe("a").await;
        t.release_probe("a").await;
        assert_eq!(t.health("a").await.unwrap().half_open_probes_in_flight, 0);
    }

    #[tokio::test]
    async fn test_reset_and_snapshot() {
        let (t, _) = tracker();
        open(&t, "b").await;
        t.record_failure("a", "x").await;
        let snap = t.snapshot().await;
        assert_eq!(snap.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        t.reset(Some("b")).await;
        assert!(t.health("b").await.is_none());
        assert!(t.can_use("b").await);

        t.reset(None).await;
        assert!(t.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_config_keeps_records() {
        let (t, _) = tracker();
        t.record_failure("a", "x").await;
        t.record_failure("a", "x").await;
        t.update_config(ResilienceConfig {
            failure_threshold: 10,
            ..config()
        })
        .await;
        assert_eq!(t.health("a").await.unwrap().failures, 2);
        t.record_failure("a", "x").await;
        assert_eq!(t.health("a").await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_probe_acquisition() {
        let (t, clock) = tracker();
        open(&t, "a").await;
        clock.advance(chrono::Duration::seconds(5));
        let t = Arc::new(t);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            handles.push(tokio::spawn(async move { t.try_acquire("a").await }));
        }
        let mut probes = 0;
        for h in handles {
            if h.await.unwrap() == Admission::Probe {
                probes += 1;
            }
        }
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_health_wire_format() {
        let h = BackendHealth {
            state: CircuitState::HalfOpen,
            failures: 5,
            successes: 1,
            last_failure: Some(1_700_000_000_000),
            last_error: Some("boom".into()),
            half_open_probes_in_flight: 1,
        };
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["state"], "half_open");
        assert_eq!(json["lastFailure"], 1_700_000_000_000i64);
        assert_eq!(json["halfOpenProbesInFlight"], 1);
    }
}
