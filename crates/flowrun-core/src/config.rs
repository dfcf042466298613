//! Environment Configuration Loader
//!
//! Loads `KEY=VALUE` files into the process environment and assembles the
//! engine configuration from it.
//!
//! ## Usage
//!
//! Call `load_environment()` early in main() before building the config:
//!
//! ```rust
//! use flowrun_core::config::{load_environment, EngineConfig};
//!
//! load_environment();
//! let config = EngineConfig::from_env();
//! assert!(config.callback_timeout_secs > 0);
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::flow::MAX_WAIT_SECS;

/// Paths checked for an environment file (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/flowrun/environment", "/etc/flowrun.env", ".env"];

/// Apply the first readable environment file to the process environment.
///
/// `FLOWRUN_ENV_FILE` is tried before `ENV_FILE_PATHS`. Variables already
/// present in the environment win over the file. Returns the applied path.
pub fn load_environment() -> Option<String> {
    let custom = std::env::var("FLOWRUN_ENV_FILE").ok();
    let loaded = custom
        .iter()
        .map(String::as_str)
        .chain(ENV_FILE_PATHS.iter().copied())
        .find_map(|path| apply_env_file(Path::new(path)).map(|_| path.to_string()));

    if loaded.is_none() {
        debug!("No environment file applied");
    }
    loaded
}

/// Returns how many variables were set, or None when the file is absent
/// or unreadable.
fn apply_env_file(path: &Path) -> Option<usize> {
    if !path.is_file() {
        return None;
    }
    let content = fs::read_to_string(path)
        .map_err(|e| warn!(path = %path.display(), error = %e, "Unreadable environment file"))
        .ok()?;

    let (mut applied, mut kept) = (0usize, 0usize);
    for (key, value) in content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(parse_env_line)
    {
        if std::env::var_os(&key).is_some() {
            kept += 1;
            continue;
        }
        std::env::set_var(&key, &value);
        applied += 1;
    }

    info!(path = %path.display(), applied, kept, "Environment file applied");
    Some(applied)
}

/// `KEY=value`, optionally prefixed by `export` and with the value quoted
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_start_matches("export ").trim_start();
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let raw = raw.trim();
    let value = ['"', '\'']
        .iter()
        .find_map(|q| raw.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(raw);
    Some((key.to_string(), value.to_string()))
}

/// Get a configuration value with a default.
pub fn get_config(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get an optional configuration value.
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get a boolean configuration value.
pub fn get_config_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

/// Get an integer configuration value.
pub fn get_config_int(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_config_u64(key: &str, default: u64) -> u64 {
    u64::try_from(get_config_int(key, default as i64)).unwrap_or(default)
}

/// Retry behaviour for state store operations
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRetryConfig {
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
        }
    }
}

/// Process-wide engine configuration.
///
/// Built once at startup and handed to every service that needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Redis URL; `None` selects the in-memory store
    pub redis_url: Option<String>,
    /// Namespace for records that are not tenant scoped (timers)
    pub namespace: String,
    /// Default callback timeout when the node sets none
    pub callback_timeout_secs: u64,
    /// Default event wait timeout when the node sets none
    pub event_timeout_secs: u64,
    /// TTL applied to persisted run snapshots
    pub run_ttl_secs: u64,
    /// Base URL callback identifiers are appended to
    pub callback_base_url: String,
    pub store_retry: StoreRetryConfig,
    /// Samples retained per metrics key
    pub metrics_samples: usize,
    /// Longest guard expression accepted
    pub expr_max_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "default".to_string(),
            callback_timeout_secs: 300,
            event_timeout_secs: 300,
            run_ttl_secs: 7 * 24 * 60 * 60,
            callback_base_url: "http://localhost:8080/api/callbacks".to_string(),
            store_retry: StoreRetryConfig::default(),
            metrics_samples: 100,
            expr_max_len: 1024,
        }
    }
}

impl EngineConfig {
    /// Build the configuration from `FLOWRUN_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            redis_url: get_config_opt("FLOWRUN_REDIS_URL"),
            namespace: get_config("FLOWRUN_NAMESPACE", &defaults.namespace),
            callback_timeout_secs: get_config_u64(
                "FLOWRUN_CALLBACK_TIMEOUT_SECS",
                defaults.callback_timeout_secs,
            )
            .min(MAX_WAIT_SECS),
            event_timeout_secs: get_config_u64(
                "FLOWRUN_EVENT_TIMEOUT_SECS",
                defaults.event_timeout_secs,
            )
            .min(MAX_WAIT_SECS),
            run_ttl_secs: get_config_u64("FLOWRUN_RUN_TTL_SECS", defaults.run_ttl_secs)
                .min(MAX_WAIT_SECS),
            callback_base_url: get_config("FLOWRUN_CALLBACK_BASE_URL", &defaults.callback_base_url),
            store_retry: StoreRetryConfig {
                max_retries: get_config_u64(
                    "FLOWRUN_STORE_MAX_RETRIES",
                    defaults.store_retry.max_retries as u64,
                ) as u32,
                min_delay: Duration::from_millis(get_config_u64(
                    "FLOWRUN_STORE_RETRY_MIN_DELAY_MS",
                    100,
                )),
                max_delay: Duration::from_millis(get_config_u64(
                    "FLOWRUN_STORE_RETRY_MAX_DELAY_MS",
                    2000,
                )),
            },
            metrics_samples: get_config_u64(
                "FLOWRUN_METRICS_SAMPLES",
                defaults.metrics_samples as u64,
            ) as usize,
            expr_max_len: get_config_u64("FLOWRUN_EXPR_MAX_LEN", defaults.expr_max_len as u64)
                as usize,
        };

        debug!(?config, "Engine configuration loaded");
        config
    }

    /// Effective callback timeout for a node-level override.
    pub fn callback_timeout(&self, node_override: Option<u64>) -> Duration {
        Duration::from_secs(node_override.unwrap_or(self.callback_timeout_secs))
    }
}
