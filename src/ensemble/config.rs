//! Tunable orchestration defaults.
//!
//! [`OrchestrationConfig`] gathers the numeric knobs shared by every topology.
//! Construct it directly, start from [`Default`], or read it from JSON; then
//! hand it to
//! [`OrchestrationBuilder::with_config`](crate::orchestration::OrchestrationBuilder::with_config).
//!
//! # Example
//!
//! ```rust
//! use ensemble::config::OrchestrationConfig;
//!
//! let config = OrchestrationConfig::default();
//! assert_eq!(config.max_iterations, 10);
//! assert_eq!(config.completion_token, "yes");
//!
//! let tuned = OrchestrationConfig::from_json_str(r#"{"max_iterations": 4}"#).unwrap();
//! assert_eq!(tuned.max_iterations, 4);
//! assert_eq!(tuned.aggregation_timeout_secs, 20);
//! ```

use crate::ensemble::history::ContextWindow;
use crate::ensemble::termination::DEFAULT_MAX_ITERATIONS;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Global settings applied by the orchestration builder.
///
/// Missing JSON fields take their default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Hard ceiling on agent turns per run.
    pub max_iterations: usize,
    /// Aggregate deadline for one concurrent round.
    pub aggregation_timeout_secs: u64,
    /// Wall-clock limit for a whole run, any topology. `None` means unbounded.
    pub run_timeout_secs: Option<u64>,
    /// Messages shown to selection and termination delegates.
    pub evaluation_window: usize,
    /// Token a termination delegate answers with when the task is done.
    pub completion_token: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            aggregation_timeout_secs: 20,
            run_timeout_secs: None,
            evaluation_window: 1,
            completion_token: "yes".to_string(),
        }
    }
}

impl OrchestrationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Parse)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::from_json_str(&text)
    }

    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_secs(self.aggregation_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    /// The window delegates should be built with.
    pub fn evaluation_context(&self) -> ContextWindow {
        ContextWindow::Recent(self.evaluation_window)
    }
}

/// Failure loading an [`OrchestrationConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Invalid config JSON: {}", e),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}
