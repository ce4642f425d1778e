//! Checksum verification for downloaded base images
//!
//! This module provides:
//! - Streaming digest calculation (SHA-256, SHA-1, MD5) in fixed-size chunks
//! - Checksum sidecar parsing (`<hex> *<filename>`)
//! - Locating the sidecar file in a download directory
//!
//! ## Example
//!
//! ```no_run
//! use fleetflash_core::verifier::{locate_checksum_record, Verifier};
//! use std::path::Path;
//!
//! let dir = Path::new("downloads");
//! let record = locate_checksum_record(dir)?;
//! let mut verifier = Verifier::new()
//!     .on_progress(|p| println!("{:.1}%", p.percentage()));
//!
//! let ok = verifier.verify(&dir.join(&record.file_name), record.algorithm, &record.expected_hex)?;
//! println!("verified: {ok}");
//! # Ok::<(), fleetflash_core::Error>(())
//! ```

use crate::error::{Error, Result};
use sha2::Digest;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// Default read chunk for checksum calculation (80 KB)
pub const DEFAULT_CHECKSUM_CHUNK_SIZE: usize = 80 * 1024;

/// Minimum chunk size (4 KB)
pub const MIN_CHECKSUM_CHUNK_SIZE: usize = 4 * 1024;

/// Maximum chunk size (16 MB)
pub const MAX_CHECKSUM_CHUNK_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Checksum Algorithm
// ============================================================================

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-1
    Sha1,
    /// MD5
    Md5,
}

impl ChecksumAlgorithm {
    /// Get the expected output length in hex characters
    pub fn hex_length(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha1 => 40,
            ChecksumAlgorithm::Md5 => 32,
        }
    }

    /// Get algorithm name
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "SHA-256",
            ChecksumAlgorithm::Sha1 => "SHA-1",
            ChecksumAlgorithm::Md5 => "MD5",
        }
    }

    /// Sidecar file extension for this algorithm (without the dot)
    pub fn extension(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    /// Try to detect algorithm from a hex string length
    pub fn from_hex_length(len: usize) -> Option<Self> {
        match len {
            64 => Some(ChecksumAlgorithm::Sha256),
            40 => Some(ChecksumAlgorithm::Sha1),
            32 => Some(ChecksumAlgorithm::Md5),
            _ => None,
        }
    }

    /// Try to detect algorithm from a file extension (with or without the dot)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha1" => Some(ChecksumAlgorithm::Sha1),
            "md5" => Some(ChecksumAlgorithm::Md5),
            _ => None,
        }
    }

    /// List all supported algorithms
    pub fn all() -> &'static [ChecksumAlgorithm] {
        &[
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Sha1,
            ChecksumAlgorithm::Md5,
        ]
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            "sha1" | "sha-1" => Ok(ChecksumAlgorithm::Sha1),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            _ => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Incremental hash context
enum Hasher {
    Sha256(sha2::Sha256),
    Sha1(sha1::Sha1),
    Md5(md5::Md5),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Md5::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => bytes_to_hex(&h.finalize()),
            Hasher::Sha1(h) => bytes_to_hex(&h.finalize()),
            Hasher::Md5(h) => bytes_to_hex(&h.finalize()),
        }
    }
}

// ============================================================================
// Checksum Record
// ============================================================================

/// Parsed checksum sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    /// Digest algorithm
    pub algorithm: ChecksumAlgorithm,
    /// Expected lowercase hex digest
    pub expected_hex: String,
    /// File the digest refers to
    pub file_name: String,
}

impl ChecksumRecord {
    /// Parse sidecar content of the form `<hex> *<filename>`
    ///
    /// `hint` (usually from the sidecar extension) takes precedence; without
    /// it the algorithm is inferred from the digest length.
    pub fn parse(content: &str, hint: Option<ChecksumAlgorithm>) -> Result<Self> {
        let line = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| Error::InvalidChecksumRecord("empty checksum file".to_string()))?;

        let (digest, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::InvalidChecksumRecord(format!("no file name in '{line}'")))?;

        let expected_hex = digest.to_lowercase();
        if !expected_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidChecksumRecord(format!(
                "digest is not hexadecimal: '{digest}'"
            )));
        }

        let file_name = rest.trim().trim_start_matches('*').to_string();
        if file_name.is_empty() {
            return Err(Error::InvalidChecksumRecord(format!(
                "no file name in '{line}'"
            )));
        }

        let algorithm = match hint {
            Some(algorithm) => algorithm,
            None => ChecksumAlgorithm::from_hex_length(expected_hex.len()).ok_or_else(|| {
                Error::InvalidChecksumRecord(format!(
                    "cannot infer algorithm from a {}-character digest",
                    expected_hex.len()
                ))
            })?,
        };

        if expected_hex.len() != algorithm.hex_length() {
            return Err(Error::InvalidChecksumRecord(format!(
                "{} digest must be {} characters, got {}",
                algorithm.name(),
                algorithm.hex_length(),
                expected_hex.len()
            )));
        }

        Ok(Self {
            algorithm,
            expected_hex,
            file_name,
        })
    }

    /// Read and parse a sidecar file, using its extension as the algorithm hint
    pub fn from_file(path: &Path) -> Result<Self> {
        let hint = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ChecksumAlgorithm::from_extension);
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, hint)
    }
}

/// Find and parse the first `*.sha256`, `*.sha1` or `*.md5` file in `dir`
///
/// Candidates are considered in file name order.
pub fn locate_checksum_record(dir: &Path) -> Result<ChecksumRecord> {
    let sidecar = find_sidecar(dir)?;
    tracing::debug!("Using checksum file {:?}", sidecar);
    ChecksumRecord::from_file(&sidecar)
}

fn find_sidecar(dir: &Path) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|_| Error::ChecksumRecordNotFound(dir.to_path_buf()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .and_then(ChecksumAlgorithm::from_extension)
                .is_some()
        })
        .collect();

    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::ChecksumRecordNotFound(dir.to_path_buf()))
}

// ============================================================================
// Verification Progress
// ============================================================================

/// Progress callback type
pub type ProgressCallback = Box<dyn FnMut(&VerifyProgress) + Send>;

/// Verification progress information
#[derive(Debug, Clone)]
pub struct VerifyProgress {
    /// Bytes hashed so far
    pub bytes_processed: u64,
    /// Total bytes to hash (if known)
    pub total_bytes: Option<u64>,
    /// Elapsed time
    pub elapsed: Duration,
}

impl VerifyProgress {
    /// Fraction complete (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.bytes_processed as f64 / total as f64).min(1.0),
            Some(_) => 1.0,
            None => 0.0,
        }
    }

    /// Completion percentage (0-100)
    pub fn percentage(&self) -> f64 {
        self.fraction() * 100.0
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Verification configuration
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Read chunk size
    pub chunk_size: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHECKSUM_CHUNK_SIZE,
        }
    }
}

impl VerifyConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set chunk size (clamped to valid range)
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(MIN_CHECKSUM_CHUNK_SIZE, MAX_CHECKSUM_CHUNK_SIZE);
        self
    }
}

/// Streaming checksum verifier
pub struct Verifier {
    config: VerifyConfig,
    progress_callback: Option<ProgressCallback>,
    cancel_flag: Arc<AtomicBool>,
}

impl Verifier {
    /// Create a new Verifier with default configuration
    pub fn new() -> Self {
        Self::with_config(VerifyConfig::default())
    }

    /// Create a Verifier with custom configuration
    pub fn with_config(config: VerifyConfig) -> Self {
        Self {
            config,
            progress_callback: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set progress callback, invoked after every chunk
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&VerifyProgress) + Send + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Get a handle to cancel the operation
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Share an existing cancel flag, e.g. a worker task's
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Calculate the lowercase hex digest of a reader
    pub fn calculate_checksum<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        algorithm: ChecksumAlgorithm,
        total_size: Option<u64>,
    ) -> Result<String> {
        let start = Instant::now();
        let mut hasher = Hasher::new(algorithm);
        let mut buffer = vec![0u8; self.config.chunk_size];
        let mut bytes_processed = 0u64;

        loop {
            if self.cancel_flag.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let n = read_full(reader, &mut buffer)?;
            if n == 0 {
                break;
            }

            hasher.update(&buffer[..n]);
            bytes_processed += n as u64;

            if let Some(ref mut callback) = self.progress_callback {
                callback(&VerifyProgress {
                    bytes_processed,
                    total_bytes: total_size,
                    elapsed: start.elapsed(),
                });
            }
        }

        Ok(hasher.finalize_hex())
    }

    /// Calculate the digest of a file
    pub fn checksum_file(&mut self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        self.calculate_checksum(&mut file, algorithm, Some(size))
    }

    /// Verify a file, returning [`Error::ChecksumMismatch`] on a wrong digest
    pub fn verify_strict(
        &mut self,
        path: &Path,
        algorithm: ChecksumAlgorithm,
        expected_hex: &str,
    ) -> Result<()> {
        let expected = expected_hex.trim().to_lowercase();
        let actual = self.checksum_file(path, algorithm)?;

        if digests_match(&actual, &expected) {
            tracing::info!("{} verified for {:?}", algorithm, path);
            Ok(())
        } else {
            tracing::warn!(
                "{} mismatch for {:?}: expected {}, got {}",
                algorithm,
                path,
                expected,
                actual
            );
            Err(Error::ChecksumMismatch {
                algorithm: algorithm.name().to_string(),
                expected,
                actual,
            })
        }
    }

    /// Verify a file against an expected digest
    pub fn verify(
        &mut self,
        path: &Path,
        algorithm: ChecksumAlgorithm,
        expected_hex: &str,
    ) -> Result<bool> {
        match self.verify_strict(path, algorithm, expected_hex) {
            Ok(()) => Ok(true),
            Err(Error::ChecksumMismatch { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Verify with the algorithm given by name
    ///
    /// An unknown name fails with [`Error::UnsupportedAlgorithm`] before the
    /// file is opened.
    pub fn verify_named(&mut self, path: &Path, algorithm: &str, expected_hex: &str) -> Result<bool> {
        let algorithm: ChecksumAlgorithm = algorithm.parse()?;
        self.verify(path, algorithm, expected_hex)
    }

    /// Verify the file a record refers to, resolved relative to `dir`
    pub fn verify_record(&mut self, dir: &Path, record: &ChecksumRecord) -> Result<()> {
        self.verify_strict(
            &dir.join(&record.file_name),
            record.algorithm,
            &record.expected_hex,
        )
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Compare two digests over their full length
fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Read as much as possible into buffer
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(total)
}

/// Convert bytes to lowercase hex string
fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ============================================================================
// Unit Tests
// ============================================================================
