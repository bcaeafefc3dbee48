//! TOML configuration for the core.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::classifier::{Classifier, SimulatedClassifier};
use crate::error::ConfigError;
use crate::job::JobSettings;
use crate::pipeline::TargetSize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Side length of the square letterbox canvas.
    pub target_size: u32,
    /// Duration that maps to 100% progress.
    pub expected_duration_ms: u64,
    /// How often callers should poll progress.
    pub tick_interval_ms: u64,
    pub ledger_path: PathBuf,
    pub simulator: SimulatorConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            target_size: 224,
            expected_duration_ms: 5_000,
            tick_interval_ms: 50,
            ledger_path: PathBuf::from("feedback_history.json"),
            simulator: SimulatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorConfig {
    pub delay_ms: u64,
    /// Fixed RNG seed; random when absent.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            delay_ms: 5_000,
            seed: None,
        }
    }
}

impl CoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_size == 0 {
            return Err(ConfigError::Invalid("target_size must be > 0".into()));
        }
        if self.expected_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "expected_duration_ms must be > 0".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            target_size: TargetSize::square(self.target_size),
            expected_duration: Duration::from_millis(self.expected_duration_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn classifier(&self) -> Arc<dyn Classifier> {
        Arc::new(SimulatedClassifier::new(
            Duration::from_millis(self.simulator.delay_ms),
            self.simulator.seed,
        ))
    }
}
