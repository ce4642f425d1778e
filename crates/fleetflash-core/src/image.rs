//! Base and built image value types

use crate::config_block::{ConfigBlock, CONFIG_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::network::Role;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// The generic OS image every role image is derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseImage {
    path: PathBuf,
    size: u64,
    version: Option<String>,
}

impl BaseImage {
    /// Open a base image and check it can hold a configuration block at `config_offset`
    pub fn open(path: impl AsRef<Path>, config_offset: u64) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| Error::InvalidBaseImage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if !metadata.is_file() {
            return Err(Error::InvalidBaseImage {
                path: path.to_path_buf(),
                reason: "not a regular file".to_string(),
            });
        }

        let size = metadata.len();
        let needed = config_offset + CONFIG_BLOCK_SIZE as u64;
        if size <= needed {
            return Err(Error::InvalidBaseImage {
                path: path.to_path_buf(),
                reason: format!("{size} bytes is too small, must be larger than {needed}"),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            size,
            version: version_from_file_name(path),
        })
    }

    /// Override the version tag
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Path on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Version tag, if known
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Take the version from names like `Skybian-0.1.0.img`
fn version_from_file_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let (_, version) = stem.split_once('-')?;
    version
        .starts_with(|c: char| c.is_ascii_digit() || c == 'v')
        .then(|| version.to_string())
}

/// An image built for one role of the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeImage {
    /// Path on disk
    pub path: PathBuf,
    /// Role the image was built for
    pub role: Role,
    /// Size in bytes, equal to the base image size
    pub size: u64,
}

impl NodeImage {
    /// Describe an already-built image file
    pub fn from_path(path: impl Into<PathBuf>, role: Role) -> Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        Ok(Self { path, role, size })
    }

    /// File name of the image
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Read the configuration block embedded in an image file
pub fn read_config_block(path: &Path, config_offset: u64) -> Result<ConfigBlock> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(config_offset))?;

    let mut slot = [0u8; CONFIG_BLOCK_SIZE];
    file.read_exact(&mut slot)?;
    ConfigBlock::decode(&slot)
}

// ============================================================================
// UNIT TESTS
// ============================================================================
