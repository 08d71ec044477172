//! Engine configuration loader for stepwise.
//!
//! Reads `stepwise.toml` from the data directory (`~/.stepwise/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use stepwise_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

/// File name of the engine configuration inside the data directory.
pub const CONFIG_FILE_NAME: &str = "stepwise.toml";

/// Load engine configuration from `{data_dir}/stepwise.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Database URL to open: the configured one, else [`default_database_url`].
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}
