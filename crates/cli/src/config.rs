//! Configuration management for the CLI
//!
//! Optional defaults live in `~/.config/cfad/config.json`; command-line flags
//! and their environment variables take precedence.

use anyhow::{Context, Result};
use detector_lib::config::{TableConfig, ThresholdConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::output::OutputFormat;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CliConfig {
    /// Store snapshot used when `--store` is not given
    pub store_path: Option<PathBuf>,
    pub default_format: Option<OutputFormat>,
    /// Thresholds used by `evaluate` when no thresholds file is given
    pub thresholds: Option<ThresholdConfig>,
    pub tables: TableConfig,
}

impl CliConfig {
    /// Load the user config; a missing file yields the defaults
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("cfad").join("config.json"))
    }
}

/// Thresholds from `file` if given, else the config file, else the defaults
pub fn resolve_thresholds(file: Option<&Path>, config: &CliConfig) -> Result<ThresholdConfig> {
    let thresholds = match file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read thresholds file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse thresholds file {}", path.display()))?
        }
        None => config.thresholds.clone().unwrap_or_default(),
    };
    thresholds.validate()?;
    Ok(thresholds)
}
