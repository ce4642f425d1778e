//! # Fleetflash Core
//!
//! Core library for turning one base OS image into a fleet of role images
//! (one manager, N nodes) and writing them to removable cards.
//!
//! ## Modules
//!
//! - `network`: network configuration validation and role addressing
//! - `config_block`: the 256-byte configuration record embedded in images
//! - `verifier`: streaming checksum verification and sidecar parsing
//! - `image` / `builder`: base image handling and per-role image construction
//! - `proxy`: byte-counting relay used as the first stage of a flash
//! - `flash`: flashing engine and the platform backend seam
//! - `session` / `task`: session context and background workers
//! - `config` / `settings`: runtime configuration and the persistent settings file
//! - `error`: error types and result aliases
//!
//! ## Example
//!
//! ```no_run
//! use fleetflash_core::{validate, BaseImage, BuildConfig, ImageBuilder};
//! use std::path::Path;
//!
//! let network = validate("192.168.0.1", "1.1.1.1, 8.8.8.8", "192.168.0.2", 2)?;
//! let config = BuildConfig::new();
//! let base = BaseImage::open("downloaded/Skybian-0.1.0.img", config.config_offset)?;
//!
//! let mut builder = ImageBuilder::with_config(config)
//!     .on_progress(|p| println!("{} {:.1}%", p.role, p.overall_percent()));
//!
//! for image in builder.build(&base, &network, Path::new("final"))? {
//!     println!("{} -> {}", image.role, image.path.display());
//! }
//! # Ok::<(), fleetflash_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod config;
pub mod config_block;
pub mod error;
pub mod flash;
pub mod image;
pub mod network;
pub mod progress;
pub mod proxy;
pub mod session;
pub mod settings;
pub mod task;
pub mod verifier;

pub use builder::{
    clean_previous_images, image_file_name, BuildConfig, BuildProgress, ImageBuilder,
    DEFAULT_IMAGE_PREFIX,
};
pub use config::Config;
pub use config_block::{ConfigBlock, Mode, CONFIG_BLOCK_SIZE, DEFAULT_CONFIG_OFFSET};
pub use error::{Error, Result};
pub use flash::{
    check_capacity, BlockDevice, BlockDeviceBackend, FlashConfig, FlashEngine, FlashJob,
    FlashProgress, FlashResult, FlashState, PipelineExit, PipelineProcess, PipelineRequest,
    NO_DEVICE_PLACEHOLDER, NO_LABEL,
};
pub use image::{read_config_block, BaseImage, NodeImage};
pub use network::{validate, NetworkConfig, Role, ValidationError};
pub use progress::{calculate_eta, calculate_speed_eta, format_duration, format_eta, format_size, format_speed};
pub use proxy::{parse_progress_line, relay, ProgressLine, DEFAULT_PROXY_CHUNK_SIZE};
pub use session::Session;
pub use settings::{
    BuildSettings, ChecksumSettings, FlashSettings, PathSettings, Settings, SettingsError,
};
pub use task::Task;
pub use verifier::{
    locate_checksum_record, ChecksumAlgorithm, ChecksumRecord, Verifier, VerifyConfig,
    VerifyProgress, DEFAULT_CHECKSUM_CHUNK_SIZE,
};
