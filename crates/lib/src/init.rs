//! Initialize the configuration directory: create ~/.talkative and a default config file.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;

/// Create the config directory and write the default config if the file does not exist.
/// Returns true when a new file was written. The API key is left out; it is read from the
/// environment.
pub fn init_config_file(config_path: &Path) -> Result<bool> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if config_path.exists() {
        log::debug!("config already exists at {}, skipping", config_path.display());
        return Ok(false);
    }
    let default_config = serde_json::to_string_pretty(&Config::default())
        .context("serializing default config")?;
    std::fs::write(config_path, default_config)
        .with_context(|| format!("writing default config to {}", config_path.display()))?;
    log::info!("created default config at {}", config_path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;

    #[test]
    fn writes_default_config_once() {
        let dir = std::env::temp_dir().join(format!("talkative-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        assert!(init_config_file(&path).unwrap());
        assert!(!init_config_file(&path).unwrap());
        let (config, _) = load_config(Some(path)).unwrap();
        assert_eq!(config.gateway.port, 7860);
        assert_eq!(config.history.max_history, 2);
        let _ = std::fs::remove_dir_all(dir);
    }
}
