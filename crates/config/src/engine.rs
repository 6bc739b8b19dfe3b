// Engine settings
// Loaded from ~/.config/strata/engine.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    // Graph diagnostics
    #[serde(rename = "graph.traceDependencyRuns")]
    pub trace_dependency_runs: bool,

    #[serde(rename = "graph.logStateTransitions")]
    pub log_state_transitions: bool,

    // Persistence
    #[serde(rename = "persistence.restoreValues")]
    pub restore_persisted_values: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            trace_dependency_runs: false,
            log_state_transitions: true,
            restore_persisted_values: true,
        }
    }
}

impl EngineSettings {
    /// Get the default settings file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("engine.json")
    }

    /// Load settings from the default path, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("{e}; using default engine settings");
                Self::default()
            }
        }
    }

    /// Load settings from an explicit `.json` or `.toml` file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents).map_err(|message| ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            }),
            Some("toml") => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Parse JSON settings. Lines starting with `//` are treated as comments.
    pub fn from_json_str(contents: &str) -> Result<Self, String> {
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");

        serde_json::from_str(&cleaned).map_err(|e| e.to_string())
    }

    /// Save settings as pretty JSON, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |e: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        fs::write(path, json).map_err(io_err)
    }
}
