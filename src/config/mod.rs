//! Layered configuration: built-in defaults, an optional YAML file, then
//! `NT_`-prefixed environment variables (`__` as the nested-key delimiter),
//! in that order of increasing precedence.
//!
//! Grounded on `original_source/core/config.py` (`Config`/`BackupConfig`/
//! `MonitoringConfig`/`LoggingConfig`/`BrowserDefaults`/`RateLimitConfig`),
//! with one deliberate deviation: there is no global `get_config`/
//! `set_config` singleton here. The loaded `Config` is handed by value (or
//! `Arc`) to each component at construction instead.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ENV_PREFIX: &str = "NT_";
const ENV_DELIMITER: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub max_backups: u32,
    pub scheduled_interval_hours: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { enabled: true, max_backups: 5, scheduled_interval_hours: 24 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub disk_warning_mb: u64,
    pub disk_critical_mb: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { disk_warning_mb: 1024, disk_critical_mb: 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub max_file_size_mb: u32,
    pub max_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), max_file_size_mb: 10, max_files: 7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserDefaults {
    pub headless_mode: String,
    pub default_timeout_ms: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub stealth_enabled: bool,
}

impl Default for BrowserDefaults {
    fn default() -> Self {
        Self { headless_mode: "shell".to_string(), default_timeout_ms: 30_000, viewport_width: 1920, viewport_height: 1080, stealth_enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub min_delay_ms: u64,
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { min_delay_ms: 1000, max_requests_per_minute: 10, max_requests_per_hour: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,

    pub backup: BackupConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub browser: BrowserDefaults,

    pub default_rate_limit: RateLimitConfig,
    pub domain_rate_limits: HashMap<String, RateLimitConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".national-treasure");
        Self {
            data_dir,
            archive_dir: None,
            database_path: None,
            backup: BackupConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
            browser: BrowserDefaults::default(),
            default_rate_limit: RateLimitConfig::default(),
            domain_rate_limits: HashMap::new(),
        }
    }
}

impl Config {
    /// Resolves the effective database path, deriving it from `data_dir`
    /// when not explicitly set.
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| self.data_dir.join("national-treasure.db"))
    }

    /// Resolves the effective archive directory, deriving it from
    /// `data_dir` when not explicitly set.
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir.clone().unwrap_or_else(|| self.data_dir.join("archive"))
    }

    /// Loads defaults, merges an optional YAML file on top, then merges
    /// `NT_`-prefixed environment variables on top of that, and finally
    /// creates `data_dir`/`archive_dir` if they don't exist.
    pub fn load(yaml_path: Option<&Path>) -> Result<Self> {
        let mut value = serde_json::to_value(Config::default()).context("serializing default config")?;

        let yaml_path = yaml_path.map(PathBuf::from).or_else(|| env::var_os("NT_CONFIG_PATH").map(PathBuf::from));
        if let Some(path) = &yaml_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
                let yaml_value: Value = serde_yaml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))?;
                merge_json(&mut value, &yaml_value);
            }
        }

        let env_value = env_overrides();
        merge_json(&mut value, &env_value);

        let mut config: Config = serde_json::from_value(value).context("deserializing merged config")?;

        if config.database_path.is_none() {
            config.database_path = Some(config.data_dir.join("national-treasure.db"));
        }
        if config.archive_dir.is_none() {
            config.archive_dir = Some(config.data_dir.join("archive"));
        }

        std::fs::create_dir_all(&config.data_dir).with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
        std::fs::create_dir_all(config.archive_dir())
            .with_context(|| format!("creating archive dir {}", config.archive_dir().display()))?;

        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing config to yaml")
    }
}

/// Builds a nested JSON object from every `NT_`-prefixed environment
/// variable, splitting the remainder on `__` into path segments
/// (lowercased, to match the struct's `snake_case` field names).
fn env_overrides() -> Value {
    let mut root = serde_json::Map::new();

    for (key, raw_value) in env::vars() {
        if key == "NT_CONFIG_PATH" || !key.starts_with(ENV_PREFIX) {
            continue;
        }
        let path: Vec<String> = key[ENV_PREFIX.len()..].split(ENV_DELIMITER).map(|s| s.to_ascii_lowercase()).collect();
        set_nested(&mut root, &path, parse_env_value(&raw_value));
    }

    Value::Object(root)
}

fn parse_env_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn set_nested(root: &mut serde_json::Map<String, Value>, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else { return };

    if rest.is_empty() {
        root.insert(head.clone(), value);
        return;
    }

    let entry = root.entry(head.clone()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(map) = entry {
        set_nested(map, rest, value);
    }
}

/// Recursively overlays `b`'s keys onto `a`; non-object values in `b`
/// replace `a`'s wholesale.
fn merge_json(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a_map), Value::Object(b_map)) => {
            for (key, b_value) in b_map {
                merge_json(a_map.entry(key.clone()).or_insert(Value::Null), b_value);
            }
        }
        (a_slot, b_value) => {
            *a_slot = b_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_archive_and_database_paths_lazily() {
        let config = Config::default();
        assert!(config.database_path.is_none());
        assert_eq!(config.database_path(), config.data_dir.join("national-treasure.db"));
        assert_eq!(config.archive_dir(), config.data_dir.join("archive"));
    }

    #[test]
    fn env_overrides_build_nested_structure() {
        let mut root = serde_json::Map::new();
        set_nested(&mut root, &["browser".to_string(), "headless_mode".to_string()], Value::String("new".to_string()));
        assert_eq!(root["browser"]["headless_mode"], Value::String("new".to_string()));
    }

    #[test]
    fn merge_json_overlays_nested_objects_without_clobbering_siblings() {
        let mut base = serde_json::json!({"browser": {"headless_mode": "shell", "stealth_enabled": true}});
        let overlay = serde_json::json!({"browser": {"headless_mode": "new"}});
        merge_json(&mut base, &overlay);
        assert_eq!(base["browser"]["headless_mode"], "new");
        assert_eq!(base["browser"]["stealth_enabled"], true);
    }

    #[test]
    fn parse_env_value_falls_back_to_string_for_non_json() {
        assert_eq!(parse_env_value("new"), Value::String("new".to_string()));
        assert_eq!(parse_env_value("30000"), Value::Number(30000.into()));
        assert_eq!(parse_env_value("true"), Value::Bool(true));
    }
}
