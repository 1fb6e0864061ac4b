//! Graph Configuration
//!
//! [`GraphConfig`] holds the knobs a host can set on a graph. It is plain
//! serde data and can be loaded from JSON; every field is optional and
//! unknown fields are rejected.
//!
//! ```json
//! { "default_trigger": "push", "emission_capacity": 128, "max_depth": 64 }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reactive::Trigger;

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: `{field}` {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings for one [`Graph`](crate::Graph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Trigger used by [`Graph::define_sink`](crate::Graph::define_sink).
    pub default_trigger: Trigger,

    /// Buffer size of the push emission channel. Slow subscribers that
    /// fall further behind than this miss emissions.
    pub emission_capacity: usize,

    /// Maximum nesting of evaluations before a read fails with
    /// [`DepthExceeded`](crate::ReactiveError::DepthExceeded).
    pub max_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_trigger: Trigger::Pull,
            emission_capacity: 64,
            max_depth: 256,
        }
    }
}

impl GraphConfig {
    /// Parse and validate a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.emission_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "emission_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_depth",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
