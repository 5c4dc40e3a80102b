//! Engine process configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// How to start an engine process, typically deserialized from the host's
/// configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Engine executable.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the engine process.
    #[serde(default)]
    pub pwd: Option<PathBuf>,
    /// Switch the engine's debug mode on after initialization.
    #[serde(default)]
    pub debug: bool,
    /// Options applied after initialization. Failures are logged, not fatal.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl EngineConfig {
    pub fn new(command: impl Into<String>) -> EngineConfig {
        EngineConfig {
            command: command.into(),
            ..EngineConfig::default()
        }
    }
}
