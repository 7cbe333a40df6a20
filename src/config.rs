//! CLI configuration
//!
//! Stored as JSON in ~/.pinhole/config.json. A missing file means defaults.

use anyhow::{Context, Result};
use pinhole_control::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinholeConfig {
    /// Rule file backing the store (defaults to ~/.pinhole/rules.json)
    pub rules_path: Option<PathBuf>,
    /// Settings for created pinholes
    pub manager: ManagerConfig,
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".pinhole"))
    }

    /// Default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Load the configuration
    ///
    /// An explicitly given path must exist; the default path may be absent.
    pub fn load(path: Option<&Path>) -> Result<PinholeConfig> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::default_config_path()?;
                if !path.exists() {
                    return Ok(PinholeConfig::default());
                }
                path
            }
        };

        let json =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;

        let config: PinholeConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Save the configuration
    pub fn save(config: &PinholeConfig, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Rule file to use: the configured one or ~/.pinhole/rules.json
    pub fn rules_path(config: &PinholeConfig) -> Result<PathBuf> {
        match &config.rules_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::base_dir()?.join("rules.json")),
        }
    }
}
