//! Engine configuration loader.
//!
//! Reads `config.toml` from `--config`, or from the Weft home directory
//! (`~/.weft/` unless `WEFT_HOME` is set), into an [`EngineConfig`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use weft_types::config::EngineConfig;

/// Resolve the Weft home directory.
///
/// Priority:
/// 1. `WEFT_HOME` environment variable
/// 2. `~/.weft`
pub fn resolve_home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WEFT_HOME") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".weft");
    }
    PathBuf::from(".weft")
}

/// Load the engine configuration.
///
/// - An explicit path must exist and parse.
/// - Without one, `{home}/config.toml` is read if present; a missing file
///   gives [`EngineConfig::default()`] and a malformed one is logged and
///   ignored.
pub async fn load_engine_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = explicit {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        return toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()));
    }

    let config_path = resolve_home_dir().join("config.toml");
    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return Ok(EngineConfig::default());
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return Ok(EngineConfig::default());
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => Ok(config),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            Ok(EngineConfig::default())
        }
    }
}
