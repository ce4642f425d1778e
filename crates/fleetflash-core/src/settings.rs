//! Persistent user settings for Fleetflash
//!
//! One TOML file per user, found at:
//! - Linux: `~/.config/fleetflash/fleetflash_config.toml`
//! - macOS: `~/Library/Application Support/fleetflash/fleetflash_config.toml`
//! - Windows: `%APPDATA%\fleetflash\fleetflash_config.toml`
//!
//! # Example
//!
//! ```toml
//! [paths]
//! download_dir = "/home/me/fleetflash/downloaded"
//! build_dir = "/home/me/fleetflash/final"
//!
//! [build]
//! config_offset = 12582912
//! image_prefix = "Skybian"
//!
//! [checksum]
//! chunk_size = 81920
//!
//! [flash]
//! poll_interval_ms = 200
//! chunk_size = 51200
//! ```

use crate::builder::DEFAULT_IMAGE_PREFIX;
use crate::config_block::DEFAULT_CONFIG_OFFSET;
use crate::proxy::DEFAULT_PROXY_CHUNK_SIZE;
use crate::verifier::DEFAULT_CHECKSUM_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "fleetflash_config.toml";

const APP_NAME: &str = "fleetflash";

/// Default progress poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// User settings loaded from configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Working directories
    pub paths: PathSettings,

    /// Image build settings
    pub build: BuildSettings,

    /// Checksum settings
    pub checksum: ChecksumSettings,

    /// Flash settings
    pub flash: FlashSettings,
}

/// Working directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    /// Where the base image and its checksum file are kept
    pub download_dir: PathBuf,

    /// Where built images are written
    pub build_dir: PathBuf,
}

/// Settings for building images
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildSettings {
    /// Byte offset of the configuration slot
    pub config_offset: u64,

    /// Prefix of built image file names
    pub image_prefix: String,
}

/// Settings for checksum verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChecksumSettings {
    /// Read chunk in bytes
    pub chunk_size: usize,
}

/// Settings for flashing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlashSettings {
    /// How often the progress log is polled
    pub poll_interval_ms: u64,

    /// Streaming proxy executable; defaults to `fleetflash-proxy` next to the CLI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_program: Option<PathBuf>,

    /// Relay chunk in bytes
    pub chunk_size: usize,
}

/// Base working directory, `~/fleetflash`
fn default_work_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

impl Default for PathSettings {
    fn default() -> Self {
        let base = default_work_dir();
        Self {
            download_dir: base.join("downloaded"),
            build_dir: base.join("final"),
        }
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            config_offset: DEFAULT_CONFIG_OFFSET,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
        }
    }
}

impl Default for ChecksumSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHECKSUM_CHUNK_SIZE,
        }
    }
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            proxy_program: None,
            chunk_size: DEFAULT_PROXY_CHUNK_SIZE,
        }
    }
}

impl Settings {
    /// Settings from the per-user file, or defaults
    pub fn load() -> Self {
        Self::load_from_path(Self::config_path())
    }

    /// Settings from `path`
    ///
    /// A missing path or file yields the defaults silently. A file that
    /// cannot be read or parsed also yields the defaults, with a warning.
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path.filter(|p| p.exists()) else {
            tracing::debug!("No settings file, using defaults");
            return Self::default();
        };

        let parsed = std::fs::read_to_string(&path)
            .map_err(|source| SettingsError::Io {
                path: path.clone(),
                source,
            })
            .and_then(|contents| Self::from_toml_str(&contents));

        match parsed {
            Ok(settings) => {
                tracing::debug!("Settings loaded from {}", path.display());
                settings
            }
            Err(e) => {
                tracing::warn!("Ignoring settings file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse settings from TOML text, reporting parse errors
    pub fn from_toml_str(contents: &str) -> Result<Self, SettingsError> {
        toml::from_str(contents).map_err(SettingsError::Deserialize)
    }

    /// Write these settings to `path`, creating parent directories
    ///
    /// Returns the path written.
    pub fn save_to_path(&self, path: Option<PathBuf>) -> Result<PathBuf, SettingsError> {
        let path = path.ok_or(SettingsError::NoConfigDir)?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        let text = toml::to_string_pretty(self).map_err(SettingsError::Serialize)?;
        std::fs::write(&path, text).map_err(io_error(&path))?;

        tracing::info!("Settings written to {}", path.display());
        Ok(path)
    }

    /// Per-user settings file, `<config dir>/fleetflash/fleetflash_config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE_NAME))
    }

    /// The default settings rendered as TOML
    pub fn default_config_string() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|e| format!("# default settings unavailable: {e}"))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError {
    let path = path.to_path_buf();
    move |source| SettingsError::Io { path, source }
}

/// Settings file errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The platform has no per-user configuration directory
    #[error("Could not determine configuration directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("Cannot access {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Settings could not be rendered as TOML
    #[error("Cannot render settings: {0}")]
    Serialize(toml::ser::Error),

    /// The file is not valid settings TOML
    #[error("Invalid settings file: {0}")]
    Deserialize(toml::de::Error),
}
