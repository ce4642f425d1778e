//! Runtime configuration for Fleetflash operations

use crate::builder::{BuildConfig, DEFAULT_IMAGE_PREFIX};
use crate::config_block::{validate_offset, DEFAULT_CONFIG_OFFSET};
use crate::error::{Error, Result};
use crate::flash::FlashConfig;
use crate::proxy::DEFAULT_PROXY_CHUNK_SIZE;
use crate::settings::{Settings, DEFAULT_POLL_INTERVAL_MS};
use crate::verifier::{VerifyConfig, DEFAULT_CHECKSUM_CHUNK_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    /// Byte offset of the configuration slot
    pub config_offset: u64,

    /// Prefix of built image file names
    pub image_prefix: String,

    /// Checksum read chunk
    pub checksum_chunk_size: usize,

    /// Progress poll interval while flashing
    pub poll_interval: Duration,

    /// Proxy relay chunk
    pub proxy_chunk_size: usize,

    /// Proxy executable override
    pub proxy_program: Option<PathBuf>,

    /// Where the base image and checksum file live
    pub download_dir: PathBuf,

    /// Where built images go
    pub build_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_offset: DEFAULT_CONFIG_OFFSET,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            checksum_chunk_size: DEFAULT_CHECKSUM_CHUNK_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            proxy_chunk_size: DEFAULT_PROXY_CHUNK_SIZE,
            proxy_program: None,
            download_dir: PathBuf::from("downloaded"),
            build_dir: PathBuf::from("final"),
        }
    }
}

impl From<&Settings> for Config {
    fn from(settings: &Settings) -> Self {
        Self {
            config_offset: settings.build.config_offset,
            image_prefix: settings.build.image_prefix.clone(),
            checksum_chunk_size: settings.checksum.chunk_size,
            poll_interval: Duration::from_millis(settings.flash.poll_interval_ms),
            proxy_chunk_size: settings.flash.chunk_size,
            proxy_program: settings.flash.proxy_program.clone(),
            download_dir: settings.paths.download_dir.clone(),
            build_dir: settings.paths.build_dir.clone(),
        }
    }
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration slot offset
    pub fn config_offset(mut self, offset: u64) -> Self {
        self.config_offset = offset;
        self
    }

    /// Set image prefix
    pub fn image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_prefix = prefix.into();
        self
    }

    /// Set checksum chunk size
    pub fn checksum_chunk_size(mut self, size: usize) -> Self {
        self.checksum_chunk_size = size;
        self
    }

    /// Set flash poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set proxy executable
    pub fn proxy_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.proxy_program = Some(program.into());
        self
    }

    /// Set build output directory
    pub fn build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = dir.into();
        self
    }

    /// Set download directory
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Reject values the build and flash paths cannot work with
    pub fn validate(&self) -> Result<()> {
        validate_offset(self.config_offset)?;
        if self.image_prefix.trim().is_empty() {
            return Err(Error::InvalidConfig("image prefix must not be empty".to_string()));
        }
        if self.image_prefix.contains(['/', '\\']) {
            return Err(Error::InvalidConfig(format!(
                "image prefix '{}' must not contain path separators",
                self.image_prefix
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Builder settings
    pub fn build_config(&self) -> BuildConfig {
        BuildConfig::new()
            .config_offset(self.config_offset)
            .image_prefix(self.image_prefix.clone())
    }

    /// Verifier settings
    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig::new().chunk_size(self.checksum_chunk_size)
    }

    /// Flash engine settings
    pub fn flash_config(&self) -> FlashConfig {
        FlashConfig::new()
            .poll_interval(self.poll_interval)
            .chunk_size(self.proxy_chunk_size)
            .proxy_program(self.proxy_program.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.config_offset, 12 * 1024 * 1024);
        assert_eq!(config.image_prefix, "Skybian");
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .config_offset(4096)
            .image_prefix("Fleet")
            .poll_interval(Duration::from_millis(10))
            .proxy_program("/opt/bin/fleetflash-proxy")
            .build_dir("/tmp/out");

        assert_eq!(config.build_config().config_offset, 4096);
        assert_eq!(config.build_config().image_prefix, "Fleet");
        assert_eq!(config.flash_config().poll_interval, Duration::from_millis(10));
        assert_eq!(
            config.flash_config().proxy_program,
            Some(PathBuf::from("/opt/bin/fleetflash-proxy"))
        );
        assert_eq!(config.build_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.build.config_offset = 8192;
        settings.flash.poll_interval_ms = 25;

        let config = Config::from(&settings);
        assert_eq!(config.config_offset, 8192);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.build_dir, settings.paths.build_dir);
    }

    #[test]
    fn test_config_validate() {
        assert!(Config::new().config_offset(0).validate().is_err());
        assert!(Config::new().config_offset(10).validate().is_err());
        assert!(Config::new().image_prefix("").validate().is_err());
        assert!(Config::new().image_prefix("a/b").validate().is_err());
        assert!(Config::new()
            .poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
