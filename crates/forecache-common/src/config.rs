//! Configuration types for forecache
//!
//! [`EngineConfig`] holds the process-wide settings; [`ModelRegistry`] holds
//! the static model definitions. Both are loaded once by the binary and are
//! immutable afterwards.

use crate::error::{Error, Result};
use crate::schedule::CheckSchedule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache directory and transfer limits
    pub storage: StorageConfig,
    /// Path index location
    pub index: IndexConfig,
    /// Download queue limits
    pub download_queue: QueueConfig,
    /// Cleanup (deletion) queue limits
    pub cleanup_queue: QueueConfig,
    /// Status document polling
    pub status: StatusConfig,
    /// Retention horizons and eviction schedule
    pub retention: RetentionConfig,
    /// Simulated download settings
    pub simulation: SimulationConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            index: IndexConfig::default(),
            download_queue: QueueConfig::default(),
            cleanup_queue: QueueConfig::cleanup(),
            status: StatusConfig::default(),
            retention: RetentionConfig::default(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the cache tree
    pub cache_dir: PathBuf,
    /// Maximum size of one downloaded file in bytes
    pub max_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            max_file_size: 30_971_520, // ~29.5 MiB
        }
    }
}

/// Path index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// redb database file
    pub path: PathBuf,
    /// Re-index files already on disk when the engine starts
    pub rebuild_on_start: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./index/paths.redb"),
            rebuild_on_start: true,
        }
    }
}

/// Limits for one task queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum tasks running at once
    pub concurrency: usize,
    /// Length of one rate-limit window (milliseconds)
    pub interval_ms: u64,
    /// Admissions allowed per window (0 = unlimited)
    pub interval_cap: u64,
    /// Per-task timeout (milliseconds, 0 = none)
    pub timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            interval_ms: 1000,
            interval_cap: 10,
            timeout_ms: 60_000,
        }
    }
}

impl QueueConfig {
    /// Defaults for the deletion queue
    #[must_use]
    pub const fn cleanup() -> Self {
        Self {
            concurrency: 2,
            interval_ms: 1000,
            interval_cap: 50,
            timeout_ms: 30_000,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-task timeout, `None` when disabled
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_ms))
        }
    }
}

/// Status document polling
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// HTTP timeout for one status fetch (milliseconds)
    pub timeout_ms: u64,
    /// Skip runs whose status document is not marked completed
    pub require_completed: bool,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            require_completed: false,
        }
    }
}

impl StatusConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retention settings
///
/// The filesystem sweep (file mtime) and the index sweep (key time, per
/// model `retentionHours`) use separate horizons.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age in hours after which cached files are deleted (`None` = keep)
    pub filesystem_hours: Option<u64>,
    /// When the eviction sweep runs
    pub cleanup_schedule: CheckSchedule,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            filesystem_hours: Some(24),
            cleanup_schedule: CheckSchedule::periodic("0 0 * * * *"),
        }
    }
}

/// Simulated download settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Extension written instead of the model's real one
    pub placeholder_extension: String,
    /// Time one simulated download takes (milliseconds)
    pub delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            placeholder_extension: ".txt".to_string(),
            delay_ms: 20_000,
        }
    }
}

impl SimulationConfig {
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Log output configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One external forecast model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    /// Registry key, also the top-level cache directory
    #[serde(default)]
    pub key: String,
    /// Display name
    pub name: String,
    /// URL the run directories are published under
    pub base_url: String,
    /// Status document path relative to `base_url`
    pub status_file: String,
    /// Polling schedule
    pub check_interval: CheckSchedule,
    /// Data file extension, dot included
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Index retention in hours (`None` = keep index entries)
    #[serde(default)]
    pub retention_hours: Option<u64>,
    /// Overrides the global filesystem retention for this model
    #[serde(default)]
    pub filesystem_retention_hours: Option<u64>,
}

fn default_file_extension() -> String {
    ".om".to_string()
}

const fn default_enabled() -> bool {
    true
}

impl ModelDefinition {
    /// Full URL of the status document
    #[must_use]
    pub fn status_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.status_file.trim_start_matches('/')
        )
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty()
            || self.key.starts_with('.')
            || self.key.contains(['/', '\\'])
        {
            return Err(Error::configuration(format!(
                "invalid model key '{}'",
                self.key
            )));
        }
        if !self.file_extension.starts_with('.') || self.file_extension.len() < 2 {
            return Err(Error::configuration(format!(
                "model {}: file extension '{}' must start with a dot",
                self.key, self.file_extension
            )));
        }
        if self.base_url.is_empty() {
            return Err(Error::configuration(format!(
                "model {}: baseUrl is empty",
                self.key
            )));
        }
        Ok(())
    }
}

/// Static set of configured models, keyed by model key
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRegistry")]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDefinition>,
}

#[derive(Deserialize)]
struct RawRegistry {
    models: BTreeMap<String, ModelDefinition>,
}

impl TryFrom<RawRegistry> for ModelRegistry {
    type Error = Error;

    fn try_from(raw: RawRegistry) -> Result<Self> {
        Self::from_map(raw.models)
    }
}

impl ModelRegistry {
    /// Build from a key -> definition map; a definition's own key, when
    /// set, must match the map key
    pub fn from_map(models: BTreeMap<String, ModelDefinition>) -> Result<Self> {
        let mut checked = BTreeMap::new();
        for (key, mut model) in models {
            if model.key.is_empty() {
                model.key.clone_from(&key);
            } else if model.key != key {
                return Err(Error::configuration(format!(
                    "model entry '{key}' declares key '{}'",
                    model.key
                )));
            }
            model.validate()?;
            checked.insert(key, model);
        }
        Ok(Self { models: checked })
    }

    /// Build from definitions that carry their own keys
    pub fn from_models(models: impl IntoIterator<Item = ModelDefinition>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for model in models {
            if map.contains_key(&model.key) {
                return Err(Error::configuration(format!(
                    "duplicate model key '{}'",
                    model.key
                )));
            }
            map.insert(model.key.clone(), model);
        }
        Self::from_map(map)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ModelDefinition> {
        self.models.get(key)
    }

    /// Look up a model, failing with [`Error::UnknownModel`]
    pub fn require(&self, key: &str) -> Result<&ModelDefinition> {
        self.get(key)
            .ok_or_else(|| Error::UnknownModel(key.to_string()))
    }

    /// All models in key order
    pub fn iter(&self) -> impl Iterator<Item = &ModelDefinition> {
        self.models.values()
    }

    /// Enabled models in key order
    pub fn enabled(&self) -> impl Iterator<Item = &ModelDefinition> {
        self.models.values().filter(|m| m.enabled)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS_JSON: &str = r#"{
        "models": {
            "dwd_icon_d2": {
                "name": "DWD ICON D2",
                "baseUrl": "https://openmeteo.s3.amazonaws.com/data_spatial/dwd_icon_d2",
                "statusFile": "/in-progress.json",
                "checkInterval": "*/1 * * * *",
                "fileExtension": ".om",
                "enabled": true,
                "retentionHours": 24
            },
            "ecmwf_ifs025": {
                "name": "ECMWF IFS025",
                "baseUrl": "https://openmeteo.s3.amazonaws.com/data_spatial/ecmwf_ifs025/",
                "statusFile": "in-progress.json",
                "checkInterval": 300000,
                "enabled": false
            }
        }
    }"#;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.download_queue.concurrency, 4);
        assert_eq!(config.cleanup_queue.concurrency, 2);
        assert_eq!(config.status.timeout(), Duration::from_secs(10));
        assert!(!config.status.require_completed);
        assert_eq!(config.retention.filesystem_hours, Some(24));
        assert_eq!(config.simulation.placeholder_extension, ".txt");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "download_queue": { "concurrency": 1 } }"#).unwrap();
        assert_eq!(config.download_queue.concurrency, 1);
        assert_eq!(config.download_queue.interval_cap, 10);
        assert_eq!(config.cleanup_queue, QueueConfig::cleanup());
    }

    #[test]
    fn test_registry_from_json() {
        let registry: ModelRegistry = serde_json::from_str(MODELS_JSON).unwrap();
        assert_eq!(registry.len(), 2);

        let icon = registry.require("dwd_icon_d2").unwrap();
        assert_eq!(icon.key, "dwd_icon_d2");
        assert_eq!(icon.retention_hours, Some(24));
        assert_eq!(
            icon.check_interval,
            CheckSchedule::Periodic("0 */1 * * * *".into())
        );
        assert_eq!(
            icon.status_url(),
            "https://openmeteo.s3.amazonaws.com/data_spatial/dwd_icon_d2/in-progress.json"
        );

        let ecmwf = registry.get("ecmwf_ifs025").unwrap();
        assert_eq!(ecmwf.file_extension, ".om");
        assert_eq!(
            ecmwf.status_url(),
            "https://openmeteo.s3.amazonaws.com/data_spatial/ecmwf_ifs025/in-progress.json"
        );
        assert_eq!(
            ecmwf.check_interval,
            CheckSchedule::FixedInterval(Duration::from_secs(300))
        );

        let enabled: Vec<&str> = registry.enabled().map(|m| m.key.as_str()).collect();
        assert_eq!(enabled, vec!["dwd_icon_d2"]);
    }

    #[test]
    fn test_registry_unknown_model() {
        let registry = ModelRegistry::default();
        assert!(matches!(
            registry.require("gfs"),
            Err(Error::UnknownModel(k)) if k == "gfs"
        ));
    }

    #[test]
    fn test_registry_rejects_bad_key() {
        let json = r#"{ "models": { "a/b": {
            "name": "x", "baseUrl": "http://x", "statusFile": "/s.json",
            "checkInterval": 60000 } } }"#;
        assert!(serde_json::from_str::<ModelRegistry>(json).is_err());
    }

    #[test]
    fn test_registry_rejects_mismatched_key() {
        let json = r#"{ "models": { "gfs": {
            "key": "icon", "name": "x", "baseUrl": "http://x", "statusFile": "/s.json",
            "checkInterval": 60000 } } }"#;
        assert!(serde_json::from_str::<ModelRegistry>(json).is_err());
    }
}
