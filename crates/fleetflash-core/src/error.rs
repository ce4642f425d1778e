//! Error types for the Fleetflash core library

use crate::network::ValidationError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Fleetflash operations
#[derive(Error, Debug)]
pub enum Error {
    /// Network configuration rejected by the validator
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Checksum algorithm not supported
    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Base image digest does not match the published record
    #[error("{algorithm} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Algorithm used
        algorithm: String,
        /// Expected digest
        expected: String,
        /// Computed digest
        actual: String,
    },

    /// No checksum sidecar file in the searched directory
    #[error("No checksum file (*.sha256, *.sha1, *.md5) found in {0}")]
    ChecksumRecordNotFound(PathBuf),

    /// Checksum sidecar file could not be parsed
    #[error("Invalid checksum record: {0}")]
    InvalidChecksumRecord(String),

    /// Base image is missing or too small to hold the configuration block
    #[error("Invalid base image {path}: {reason}")]
    InvalidBaseImage {
        /// Path of the image
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Rendered configuration block does not fit its slot
    #[error("Configuration block is {len} bytes, the slot holds {max}")]
    ConfigBlockTooLarge {
        /// Rendered length
        len: usize,
        /// Slot size
        max: usize,
    },

    /// Image construction failed for a role
    #[error("Failed to build {role} image: {message}")]
    Build {
        /// Role being built
        role: String,
        /// Underlying failure
        message: String,
    },

    /// Out of disk space while building
    #[error("Insufficient disk space while writing {path}")]
    InsufficientSpace {
        /// File being written
        path: PathBuf,
    },

    /// Image does not fit on the target device
    #[error("Destination too small: image is {image_size} bytes, device is {device_size} bytes")]
    DestinationTooSmall {
        /// Image size in bytes
        image_size: u64,
        /// Device size in bytes
        device_size: u64,
    },

    /// Target device disappeared or was never present
    #[error("Target device not found: {0}")]
    DeviceNotFound(String),

    /// Privileged write stage failed mid-flash
    #[error("Write failed: {0}")]
    WriteFailure(String),

    /// A flash job is already running
    #[error("A flash is already in progress on {0}")]
    FlashInProgress(String),

    /// A checksum verification is already running
    #[error("A checksum verification is already in progress")]
    VerifyInProgress,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error during read/write operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the target device must be treated as corrupted after this error
    pub fn device_corrupted(&self) -> bool {
        matches!(self, Error::WriteFailure(_) | Error::Cancelled)
    }
}

/// Result type alias using the Fleetflash error type
pub type Result<T> = std::result::Result<T, Error>;
