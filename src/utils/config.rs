//! Configuration file management

use crate::models::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Loads and persists the YAML configuration file
pub struct ConfigManager;

impl ConfigManager {
    /// Default config path under the platform config directory
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("No config directory found")?;
        Ok(config_dir.join("audiobook-shepherd").join("config.yaml"))
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Write configuration to a YAML file, creating parent directories
    pub fn save(config: &Config, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
