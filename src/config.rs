//! Configuration for shterm.
//!
//! Settings are read from `~/.shterm/config.toml`:
//!
//! ```toml
//! prompt = "[shterm]$ "
//! log_level = "info"
//!
//! [system]
//! # "interrupt" wakes blocked commands, "checkpoint" only flags them
//! cancel_strategy = "interrupt"
//!
//! [display]
//! buffer_max = 150
//! render_interval_ms = 100
//! auto_completion_max = 50
//! ```
//!
//! A missing or unparsable file falls back to the defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::input::DEFAULT_COMPLETION_MAX;
use crate::core::runtime::DEFAULT_PROMPT;
use crate::core::screen::DEFAULT_BUFFER_MAX;
use crate::core::worker::CancelStrategy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not determine config path")]
    NoHome,
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prompt written after every command
    pub prompt: String,
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
    pub system: SystemConfig,
    pub display: DisplayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            log_level: "info".to_string(),
            system: SystemConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

/// Command execution settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub cancel_strategy: CancelStrategy,
}

/// Screen and rendering settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Lines kept in the screen buffer
    pub buffer_max: usize,
    /// Minimum time between two deferred paints
    pub render_interval_ms: u64,
    /// Completion candidates listed at most
    pub auto_completion_max: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            buffer_max: DEFAULT_BUFFER_MAX,
            render_interval_ms: 100,
            auto_completion_max: DEFAULT_COMPLETION_MAX,
        }
    }
}

impl DisplayConfig {
    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_or_default(&path),
            None => Self::default(),
        }
    }

    /// Load `path`, falling back to defaults if it is missing or broken
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        Self::load_from(path).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::get_config_path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }
}

/// `~/.shterm`, created on first use
pub fn config_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".shterm");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

/// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.prompt, "[shterm]$ ");
        assert_eq!(config.system.cancel_strategy, CancelStrategy::Interrupt);
        assert_eq!(config.display.buffer_max, 150);
        assert_eq!(config.display.render_interval(), Duration::from_millis(100));
        assert_eq!(config.display.auto_completion_max, 50);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            prompt = "> "

            [system]
            cancel_strategy = "checkpoint"

            [display]
            buffer_max = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.prompt, "> ");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.system.cancel_strategy, CancelStrategy::Checkpoint);
        assert_eq!(config.display.buffer_max, 20);
        assert_eq!(config.display.auto_completion_max, 50);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let parsed = toml::from_str::<Config>("[system]\ncancel_strategy = \"ctypes\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!("shterm-config-{}.toml", std::process::id()));
        let mut config = Config::default();
        config.log_level = "debug".to_string();
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);

        fs::write(&path, "prompt = [").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse { .. })));
        assert_eq!(Config::load_or_default(&path), Config::default());

        let _ = fs::remove_file(&path);
    }
}
