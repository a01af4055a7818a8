//! Engine configuration loader for Gantry.
//!
//! Reads `config.toml` from the data directory (`~/.gantry/` by default) and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the file
//! is missing or malformed.

use std::path::{Path, PathBuf};

use gantry_types::config::EngineConfig;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "GANTRY_DATA_DIR";

/// Resolve the data directory: `GANTRY_DATA_DIR`, else `~/.gantry`, else `./.gantry`.
pub fn resolve_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gantry")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - A relative `contracts_dir` is resolved against `data_dir`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            if let Some(dir) = config.contracts_dir.as_mut().filter(|d| d.is_relative()) {
                *dir = data_dir.join(&*dir);
            }
            tracing::debug!(path = %config_path.display(), "loaded engine config");
            config
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}
