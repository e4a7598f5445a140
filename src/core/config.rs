use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Invalid detector configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("detection interval must be greater than zero")]
    ZeroInterval,
    #[error("stall threshold must be greater than zero")]
    ZeroStallThreshold,
    #[error("shutdown timeout must be greater than zero")]
    ZeroShutdownTimeout,
}

/// Settings consumed when a scheduler is built
///
/// Missing fields in a JSON document fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Cycle detection over tracked mutexes
    pub detect_explicit_locks: bool,
    /// Heuristic cycle detection over monitors
    pub detect_implicit_locks: bool,
    /// Heartbeat monitoring of the critical thread
    pub detect_stalls: bool,
    /// Time between detection ticks
    pub detection_interval_ms: u64,
    /// Time before the first tick
    pub initial_delay_ms: u64,
    /// How long the critical thread may go without running a heartbeat
    pub stall_threshold_ms: u64,
    /// Bound on waiting for background threads when stopping
    pub shutdown_timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            detect_explicit_locks: true,
            detect_implicit_locks: true,
            detect_stalls: true,
            detection_interval_ms: 5000,
            initial_delay_ms: 3000,
            stall_threshold_ms: 5000,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl DetectorConfig {
    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detection_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.stall_threshold_ms == 0 {
            return Err(ConfigError::ZeroStallThreshold);
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ZeroShutdownTimeout);
        }
        Ok(())
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: DetectorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("Invalid config {}", path.display()))
    }
}
