//! Host configuration
//!
//! Everything the host boundary needs to know before the first block:
//! sample rate, buffer size, audio channel counts and whether host
//! parameters are smoothed. Loaded from JSON; every field has a default.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub sample_rate: f32,
    /// Maximum frames per host callback
    pub buffer_size: usize,
    pub audio_inputs: usize,
    pub audio_outputs: usize,
    /// Slew host parameters over one buffer instead of stepping them
    pub smooth_parameters: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            buffer_size: 512,
            audio_inputs: 2,
            audio_outputs: 2,
            smooth_parameters: true,
        }
    }
}

impl HostConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&json)?;
        debug!(path = %path.display(), ?config, "host config loaded");
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
        }
        Ok(())
    }
}
