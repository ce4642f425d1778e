//! Image builder
//!
//! Derives one image per fleet role from a base image. Each image is a byte
//! copy of the base with the 256-byte configuration slot at `config_offset`
//! replaced by that role's [`ConfigBlock`].
//!
//! Roles are built strictly one after another. A role that fails has its
//! partial file removed; images finished before it stay valid on disk.
//! Role images left in the destination by an earlier build with the same
//! prefix are deleted first, so a smaller fleet never inherits stale nodes.
//!
//! ## Example
//!
//! ```no_run
//! use fleetflash_core::builder::{BuildConfig, ImageBuilder};
//! use fleetflash_core::image::BaseImage;
//! use fleetflash_core::network::validate;
//! use std::path::Path;
//!
//! let network = validate("192.168.0.1", "1.1.1.1", "192.168.0.2", 2)?;
//! let config = BuildConfig::new();
//! let base = BaseImage::open("Skybian-0.1.0.img", config.config_offset)?;
//!
//! let mut builder = ImageBuilder::with_config(config)
//!     .on_progress(|p| println!("{}: {:.0}% ({:.0}% overall)", p.role, p.image_percent(), p.overall_percent()));
//! let images = builder.build(&base, &network, Path::new("final"))?;
//! assert_eq!(images.len(), 3);
//! # Ok::<(), fleetflash_core::Error>(())
//! ```

use crate::config_block::{validate_offset, ConfigBlock, CONFIG_BLOCK_SIZE, DEFAULT_CONFIG_OFFSET};
use crate::error::{Error, Result};
use crate::image::{BaseImage, NodeImage};
use crate::network::{NetworkConfig, Role};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default file name prefix for built images
pub const DEFAULT_IMAGE_PREFIX: &str = "Skybian";

/// File name of the image built for `role`, e.g. `Skybian-node-2.img`
pub fn image_file_name(prefix: &str, role: Role) -> String {
    format!("{prefix}-{}.img", role.nick())
}

/// Whether `name` is a role image file name for `prefix`
fn is_role_image_name(name: &str, prefix: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix('-'))
        .and_then(|r| r.strip_suffix(".img"))
    else {
        return false;
    };
    rest == "manager"
        || rest
            .strip_prefix("node-")
            .is_some_and(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()))
}

/// Delete role images with `prefix` left in `dir` by an earlier build
///
/// Other files are kept, and so is `keep` (the base image may live in the
/// same folder). A missing directory has nothing to clean. Returns the
/// number of files removed.
pub fn clean_previous_images(dir: &Path, prefix: &str, keep: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| is_role_image_name(name, prefix));
        if !matches || !entry.file_type()?.is_file() || same_file(&path, keep) {
            continue;
        }
        tracing::debug!("Removing stale image {:?}", path);
        std::fs::remove_file(&path)?;
        removed += 1;
    }
    Ok(removed)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Build progress information
#[derive(Debug, Clone, PartialEq)]
pub struct BuildProgress {
    /// Role currently being built
    pub role: Role,
    /// Zero-based position of the role in build order
    pub role_index: u32,
    /// Number of images in this build
    pub total_roles: u32,
    /// Fraction of the current image written (0.0 to 1.0)
    pub image_fraction: f64,
}

impl BuildProgress {
    /// Completion of the current image (0-100)
    pub fn image_percent(&self) -> f64 {
        self.image_fraction * 100.0
    }

    /// Completion of the whole build (0-100)
    ///
    /// `(role_index + image_fraction) / total_roles`
    pub fn overall_percent(&self) -> f64 {
        if self.total_roles == 0 {
            return 100.0;
        }
        (f64::from(self.role_index) + self.image_fraction) / f64::from(self.total_roles) * 100.0
    }
}

/// Progress callback type
pub type ProgressCallback = Box<dyn FnMut(&BuildProgress) + Send>;

/// Configuration for a build
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Byte offset of the configuration slot (positive multiple of 4)
    pub config_offset: u64,
    /// File name prefix of built images
    pub image_prefix: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            config_offset: DEFAULT_CONFIG_OFFSET,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
        }
    }
}

impl BuildConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration slot offset
    pub fn config_offset(mut self, offset: u64) -> Self {
        self.config_offset = offset;
        self
    }

    /// Set the image file name prefix
    pub fn image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_prefix = prefix.into();
        self
    }

    /// Read chunk used for copying: a quarter of the offset
    pub fn chunk_size(&self) -> u64 {
        self.config_offset / 4
    }
}

/// Builds role images from a base image
pub struct ImageBuilder {
    config: BuildConfig,
    progress_callback: Option<ProgressCallback>,
    cancel_flag: Arc<AtomicBool>,
}

impl ImageBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self::with_config(BuildConfig::default())
    }

    /// Create a builder with custom configuration
    pub fn with_config(config: BuildConfig) -> Self {
        Self {
            config,
            progress_callback: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set progress callback, invoked after every chunk
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&BuildProgress) + Send + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Get a handle to cancel the build
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Share an existing cancel flag, e.g. a worker task's
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build one image per role of `network` into `dest_dir`
    ///
    /// Images are returned in build order, manager first.
    pub fn build(
        &mut self,
        base: &BaseImage,
        network: &NetworkConfig,
        dest_dir: &Path,
    ) -> Result<Vec<NodeImage>> {
        let offset = self.config.config_offset;
        validate_offset(offset)?;

        let end_of_slot = offset + CONFIG_BLOCK_SIZE as u64;
        if base.size() <= end_of_slot {
            return Err(Error::InvalidBaseImage {
                path: base.path().to_path_buf(),
                reason: format!(
                    "{} bytes cannot hold a configuration block at offset {offset}",
                    base.size()
                ),
            });
        }

        // Encode every block up front so an oversized one fails before any file exists
        let roles = network.roles();
        let blocks = roles
            .iter()
            .map(|&role| ConfigBlock::for_role(network, role).encode())
            .collect::<Result<Vec<_>>>()?;

        std::fs::create_dir_all(dest_dir)?;
        let stale = clean_previous_images(dest_dir, &self.config.image_prefix, base.path())?;
        if stale > 0 {
            tracing::info!("Removed {} images of an earlier build from {:?}", stale, dest_dir);
        }

        let total_roles = network.total_roles();
        let mut images = Vec::with_capacity(roles.len());

        for (position, (&role, slot)) in roles.iter().zip(&blocks).enumerate() {
            let path = dest_dir.join(image_file_name(&self.config.image_prefix, role));
            let role_index = u32::try_from(position).unwrap_or(u32::MAX);
            tracing::info!("Building {} image at {:?}", role, path);

            let tracker = RoleTracker {
                role,
                role_index,
                total_roles,
                total_bytes: base.size(),
                done_bytes: 0,
            };

            if let Err(e) = self.build_role(base, slot, &path, tracker) {
                if let Err(rm) = std::fs::remove_file(&path) {
                    tracing::debug!("Could not remove partial image {:?}: {}", path, rm);
                }
                tracing::warn!("Build of {} image failed: {}", role, e);
                return Err(classify_failure(e, role, &path));
            }

            images.push(NodeImage {
                path,
                role,
                size: base.size(),
            });
        }

        tracing::info!("Built {} images in {:?}", images.len(), dest_dir);
        Ok(images)
    }

    fn build_role(
        &mut self,
        base: &BaseImage,
        slot: &[u8; CONFIG_BLOCK_SIZE],
        path: &Path,
        mut tracker: RoleTracker,
    ) -> Result<()> {
        let offset = self.config.config_offset;
        let chunk = usize::try_from(self.config.chunk_size())
            .map_err(|_| Error::InvalidConfig(format!("offset {offset} is too large")))?;
        let mut buffer = vec![0u8; chunk];

        let mut source = File::open(base.path())?;
        let mut dest = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        self.copy_range(&mut source, &mut dest, offset, &mut buffer, &mut tracker)?;

        dest.write_all(slot)?;
        source.seek(SeekFrom::Current(CONFIG_BLOCK_SIZE as i64))?;
        tracker.done_bytes += CONFIG_BLOCK_SIZE as u64;

        let rest = base.size() - offset - CONFIG_BLOCK_SIZE as u64;
        self.copy_range(&mut source, &mut dest, rest, &mut buffer, &mut tracker)?;

        dest.flush()?;
        self.report(&tracker);
        Ok(())
    }

    fn copy_range(
        &mut self,
        source: &mut File,
        dest: &mut File,
        len: u64,
        buffer: &mut [u8],
        tracker: &mut RoleTracker,
    ) -> Result<()> {
        let mut remaining = len;
        while remaining > 0 {
            if self.cancel_flag.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            // Bounded by buffer.len(), so the cast cannot truncate
            let n = remaining.min(buffer.len() as u64) as usize;
            source.read_exact(&mut buffer[..n])?;
            dest.write_all(&buffer[..n])?;

            remaining -= n as u64;
            tracker.done_bytes += n as u64;
            self.report(tracker);
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&mut self, tracker: &RoleTracker) {
        if let Some(ref mut callback) = self.progress_callback {
            let image_fraction = if tracker.total_bytes == 0 {
                1.0
            } else {
                (tracker.done_bytes as f64 / tracker.total_bytes as f64).min(1.0)
            };
            callback(&BuildProgress {
                role: tracker.role,
                role_index: tracker.role_index,
                total_roles: tracker.total_roles,
                image_fraction,
            });
        }
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RoleTracker {
    role: Role,
    role_index: u32,
    total_roles: u32,
    total_bytes: u64,
    done_bytes: u64,
}

fn classify_failure(error: Error, role: Role, path: &Path) -> Error {
    match error {
        Error::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => Error::InsufficientSpace {
            path: path.to_path_buf(),
        },
        Error::Io(e) => Error::Build {
            role: role.nick(),
            message: e.to_string(),
        },
        other => other,
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
