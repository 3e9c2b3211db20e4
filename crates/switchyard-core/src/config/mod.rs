use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::equivalence::Tier;
use crate::error::ConfigError;

/// Default cap applied to output tokens when the caller does not set one.
pub const OUTPUT_TOKEN_MAX: u32 = 32_000;

/// Root configuration for switchyard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub resilience: ResilienceConfig,
    /// Tier table overrides. Empty means built-in tiers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<Tier>,
    /// Where the health snapshot lives. Defaults to `~/.switchyard/state`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    pub output_token_max: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resilience: ResilienceConfig::default(),
            tiers: Vec::new(),
            state_dir: None,
            output_token_max: OUTPUT_TOKEN_MAX,
        }
    }
}

impl Config {
    /// Get expanded state directory path.
    pub fn state_path(&self) -> PathBuf {
        match &self.state_dir {
            Some(path) if path.starts_with("~/") || path.starts_with("~\\") => {
                match dirs::home_dir() {
                    Some(home) => home.join(&path[2..]),
                    None => PathBuf::from(path),
                }
            }
            Some(path) => PathBuf::from(path),
            None => get_data_dir().join("state"),
        }
    }

    /// Fixed location of the persisted circuit-breaker snapshot.
    pub fn health_snapshot_path(&self) -> PathBuf {
        self.state_path().join(crate::health::persist::SNAPSHOT_FILE)
    }
}

/// Circuit-breaker and fallback settings. Treated as an immutable snapshot
/// for the duration of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub notify_on_fallback: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_concurrency_limit: u32,
    /// Whether auth failures may switch to another backend.
    pub fallback_on_auth: bool,
    /// Backends tried first when looking for an equivalent model.
    pub preferred_backends: Vec<String>,
    pub persist_interval_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            notify_on_fallback: true,
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 60_000,
            half_open_concurrency_limit: 1,
            fallback_on_auth: false,
            preferred_backends: Vec::new(),
            persist_interval_ms: 30_000,
        }
    }
}

impl ResilienceConfig {
    /// Apply a per-call override on top of this snapshot.
    pub fn merge(&self, over: &ResilienceOverride) -> ResilienceConfig {
        ResilienceConfig {
            enabled: over.enabled.unwrap_or(self.enabled),
            max_attempts: over.max_attempts.unwrap_or(self.max_attempts),
            notify_on_fallback: over.notify_on_fallback.unwrap_or(self.notify_on_fallback),
            failure_threshold: over.failure_threshold.unwrap_or(self.failure_threshold),
            success_threshold: over.success_threshold.unwrap_or(self.success_threshold),
            cooldown_ms: over.cooldown_ms.unwrap_or(self.cooldown_ms),
            half_open_concurrency_limit: over
                .half_open_concurrency_limit
                .unwrap_or(self.half_open_concurrency_limit),
            fallback_on_auth: over.fallback_on_auth.unwrap_or(self.fallback_on_auth),
            preferred_backends: over
                .preferred_backends
                .clone()
                .unwrap_or_else(|| self.preferred_backends.clone()),
            persist_interval_ms: self.persist_interval_ms,
        }
    }
}

/// Per-call override; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceOverride {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub notify_on_fallback: Option<bool>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub half_open_concurrency_limit: Option<u32>,
    pub fallback_on_auth: Option<bool>,
    pub preferred_backends: Option<Vec<String>>,
}

// ====== Config loading/saving ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `SWITCHYARD_CONFIG` env var: full JSON config
/// 2. File fallback (`~/.switchyard/config.json`)
/// 3. Individual env vars merged on top of the file
pub fn load_config_from_env() -> Config {
    if let Ok(json) = std::env::var("SWITCHYARD_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Failed to parse SWITCHYARD_CONFIG: {}", e);
            }
        }
    }

    let mut cfg = load_config(None);
    apply_env_overrides(&mut cfg.resilience);

    if let Ok(v) = std::env::var("SWITCHYARD_STATE_DIR") {
        cfg.state_dir = Some(v);
    }

    cfg
}

fn apply_env_overrides(res: &mut ResilienceConfig) {
    if let Some(v) = env_parse::<bool>("SWITCHYARD_FALLBACK_ENABLED") {
        res.enabled = v;
    }
    if let Some(v) = env_parse::<u32>("SWITCHYARD_MAX_ATTEMPTS") {
        res.max_attempts = v;
    }
    if let Some(v) = env_parse::<bool>("SWITCHYARD_NOTIFY_ON_FALLBACK") {
        res.notify_on_fallback = v;
    }
    if let Some(v) = env_parse::<u32>("SWITCHYARD_FAILURE_THRESHOLD") {
        res.failure_threshold = v;
    }
    if let Some(v) = env_parse::<u32>("SWITCHYARD_SUCCESS_THRESHOLD") {
        res.success_threshold = v;
    }
    if let Some(v) = env_parse::<u64>("SWITCHYARD_COOLDOWN_MS") {
        res.cooldown_ms = v;
    }
    if let Some(v) = env_parse::<u32>("SWITCHYARD_HALF_OPEN_LIMIT") {
        res.half_open_concurrency_limit = v;
    }
    if let Some(v) = env_parse::<bool>("SWITCHYARD_FALLBACK_ON_AUTH") {
        res.fallback_on_auth = v;
    }
    if let Ok(v) = std::env::var("SWITCHYARD_PREFERRED_BACKENDS") {
        res.preferred_backends = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring {}: cannot parse '{}'", key, raw);
            None
        }
    }
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    get_home_dir().join("config.json")
}

/// Get the switchyard data directory.
pub fn get_data_dir() -> PathBuf {
    let path = get_home_dir();
    std::fs::create_dir_all(&path).ok();
    path
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> std::result::Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(())
}
