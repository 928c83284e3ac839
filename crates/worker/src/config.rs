//! Worker configuration
//!
//! Defaults come from `WorkerConfig::default()`; environment variables
//! prefixed `CFAD_` override them, with `__` separating nested keys, e.g.
//! `CFAD_DETECTOR__THRESHOLDS__CRITICAL_MULTIPLIER=4`.

use anyhow::{Context, Result};
use config::{Config, Environment};
use detector_lib::DetectorConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use detector_lib::alerting::TELEGRAM_API_BASE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Instance name attached to every structured log line
    pub instance: String,

    /// API server port for health/metrics
    pub api_port: u16,

    pub cycle_interval_secs: u64,

    /// Run a single cycle and exit
    pub run_once: bool,

    /// JSON accounts event read at the start of every cycle
    pub accounts_file: PathBuf,

    /// Snapshot file for the key-value store; in-memory only when unset
    pub store_path: Option<PathBuf>,

    /// Base URL of the metrics and distribution gateway
    pub gateway_url: String,

    pub telegram_api_base: String,

    pub detector: DetectorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            api_port: 8080,
            cycle_interval_secs: 900,
            run_once: false,
            accounts_file: PathBuf::from("accounts.json"),
            store_path: None,
            gateway_url: "http://cdn-gateway:9090".to_string(),
            telegram_api_base: TELEGRAM_API_BASE.to_string(),
            detector: DetectorConfig::default(),
        }
    }
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "abuse-worker".to_string())
}

impl WorkerConfig {
    /// Load from the process environment
    pub fn load() -> Result<Self> {
        Self::from_environment(Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix("CFAD")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Layer an environment source over the defaults and validate the result
    pub fn from_environment(environment: Environment) -> Result<Self> {
        let defaults =
            Config::try_from(&WorkerConfig::default()).context("failed to serialize defaults")?;
        let config: WorkerConfig = Config::builder()
            .add_source(defaults)
            .add_source(environment)
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.detector
            .validate()
            .context("invalid detector configuration")?;
        anyhow::ensure!(
            self.cycle_interval_secs > 0,
            "cycle interval must be at least 1 second"
        );
        url::Url::parse(&self.gateway_url)
            .with_context(|| format!("invalid gateway url '{}'", self.gateway_url))?;
        url::Url::parse(&self.telegram_api_base)
            .with_context(|| format!("invalid telegram api base '{}'", self.telegram_api_base))?;
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    #[cfg(test)]
    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self::from_environment(Self::environment().source(Some(map)))
    }
}
