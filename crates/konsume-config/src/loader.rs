//! Configuration loader.
//!
//! Reads the file named by `KONSUME_CONFIG_PATH` (default
//! `/config/config.yaml`). The file extension selects the parser: `.yaml` /
//! `.yml` for YAML, `.json` for JSON; anything else is rejected.

use std::env;
use std::path::Path;

use tracing::{debug, info};

use crate::{Config, ConfigError, Result};

const CONFIG_PATH_ENV: &str = "KONSUME_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Load and validate the configuration from the path in `KONSUME_CONFIG_PATH`.
pub fn load() -> Result<Config> {
    let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| {
        debug!("no configuration path defined, using default path {DEFAULT_CONFIG_PATH}");
        DEFAULT_CONFIG_PATH.to_string()
    });
    load_from_file(&path)
}

/// Load and validate the configuration from an explicit path.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    info!(path = %path.display(), "loading configuration");

    let data = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.display().to_string())
        } else {
            ConfigError::Read(e)
        }
    })?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let mut config: Config = match extension.as_str() {
        "yaml" | "yml" => {
            serde_yaml::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        "json" => serde_json::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))?,
        other => return Err(ConfigError::FormatNotSupported(other.to_string())),
    };

    config.validate()?;
    info!("loaded configuration successfully");
    Ok(config)
}
