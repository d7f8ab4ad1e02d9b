//! Configuration loading for the forecache binary
//!
//! Engine settings come from an optional TOML/JSON file, overridden by
//! `FORECACHE__SECTION__KEY` environment variables. Model definitions come
//! from a separate JSON or TOML file with a top-level `models` map.

use anyhow::{Context, Result};
use forecache_common::{EngineConfig, ModelRegistry};
use std::path::Path;

/// Prefix of environment overrides (`FORECACHE__STORAGE__CACHE_DIR=...`)
pub const ENV_PREFIX: &str = "FORECACHE";

/// Load engine settings. A missing file yields the defaults.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Invalid config {}", path.display()))
}

/// Load and validate the model definitions
pub fn load_models(path: &Path) -> Result<ModelRegistry> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read models file {}", path.display()))?;

    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let registry: ModelRegistry = if is_toml {
        toml::from_str(&content)
            .with_context(|| format!("Invalid models file {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid models file {}", path.display()))?
    };

    if registry.is_empty() {
        anyhow::bail!("No models defined in {}", path.display());
    }
    Ok(registry)
}
