// src/config.rs

//! Runtime configuration for the planar framebuffer backend.
//!
//! A [`Config`] deserializes from a JSON file; every section and field has
//! a default, so a missing file or a partial one is never an error worth
//! stopping for. The interesting policy lives in
//! [`DeviceConfig::resolve_path`]: an explicit configured path wins, then
//! the `FRAMEBUFFER` environment variable, then `/dev/fb0`.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Device node used when neither the config nor the environment names one.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/fb0";

/// Console node used when the config does not name one. `/dev/tty0` aliases
/// the currently visible VT and is resolved to a concrete console on open.
pub const DEFAULT_CONSOLE_PATH: &str = "/dev/tty0";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Framebuffer device node. Overrides the `FRAMEBUFFER` environment
    /// variable when set.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Virtual console device node.
    pub path: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            path: PathBuf::from(DEFAULT_CONSOLE_PATH),
        }
    }
}

impl DeviceConfig {
    /// The framebuffer path to open: explicit config value, then the
    /// `FRAMEBUFFER` environment variable, then [`DEFAULT_DEVICE_PATH`].
    pub fn resolve_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        if let Some(path) = env::var_os("FRAMEBUFFER") {
            return PathBuf::from(path);
        }
        PathBuf::from(DEFAULT_DEVICE_PATH)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("could not parse config file {}", path.display()))
    }

    /// Loads `path` when given, falling back to defaults on any failure.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(path) => match Config::load(path) {
                Ok(config) => {
                    info!("Config: loaded {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Config: {:#}; using defaults", e);
                    Config::default()
                }
            },
            None => Config::default(),
        }
    }
}
