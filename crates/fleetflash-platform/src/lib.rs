//! # Fleetflash Platform
//!
//! Platform adapters for the write half of a flash.
//!
//! The unprivileged process streams image bytes through the proxy; this crate
//! knows how each OS turns those bytes into a raw device write:
//!
//! - which command performs the privileged copy (`pkexec dd`, `authopen`,
//!   or our own `raw-write` sink on Windows)
//! - how a card is dismounted before and released after the write
//! - how the raw sink pads the final block to the sector size
//!
//! ## Safety
//!
//! Raw device writes destroy data. Callers must only pass device paths that
//! `fleetflash-detect` reported as safe targets.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::Command;
use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device access denied (need elevated privileges)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device is busy or locked
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to unmount device
    #[error("Unmount failed: {0}")]
    UnmountFailed(String),

    /// Operation not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Command execution failed
    #[error("Command failed: {0}")]
    CommandFailed(String),
}

/// Result type for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Sector size raw physical drives require writes to be aligned to
pub const SECTOR_SIZE: usize = 512;

/// Default raw sink read chunk
pub const DEFAULT_SINK_CHUNK_SIZE: usize = 1024 * 1024;

/// Align a value up to the given alignment
#[inline]
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Check if a value is aligned to the given alignment
#[inline]
#[must_use]
pub fn is_aligned(value: usize, alignment: usize) -> bool {
    alignment == 0 || value % alignment == 0
}

/// The privileged stage of the flash pipeline
///
/// Reads image bytes on stdin and writes them to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterCommand {
    /// Program to run
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
}

impl WriterCommand {
    /// Create a command for `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Builder: append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// A `std::process::Command` ready to spawn
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for WriterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Writer that only emits whole sectors
///
/// Partial sectors are held back until more bytes arrive. [`finish`] pads
/// the remainder with zeroes to the next sector boundary.
///
/// [`finish`]: SectorWriter::finish
pub struct SectorWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
    written: u64,
}

impl<W: Write> SectorWriter<W> {
    /// Wrap `inner`
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(SECTOR_SIZE),
            written: 0,
        }
    }

    /// Bytes handed to the inner writer so far
    pub fn written(&self) -> u64 {
        self.written
    }

    fn emit(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Pad and write the held-back tail, flush, and return total bytes written
    ///
    /// # Errors
    ///
    /// Returns an error if the inner writer fails.
    pub fn finish(mut self) -> io::Result<u64> {
        if !self.pending.is_empty() {
            let mut tail = std::mem::take(&mut self.pending);
            tail.resize(align_up(tail.len(), SECTOR_SIZE), 0);
            self.emit(&tail)?;
        }
        self.inner.flush()?;
        Ok(self.written)
    }
}

impl<W: Write> Write for SectorWriter<W> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let accepted = buf.len();

        // Complete a held-back sector first
        if !self.pending.is_empty() {
            let take = (SECTOR_SIZE - self.pending.len()).min(buf.len());
            self.pending.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.pending.len() < SECTOR_SIZE {
                return Ok(accepted);
            }
            let sector = std::mem::take(&mut self.pending);
            self.emit(&sector)?;
        }

        let whole = buf.len() - buf.len() % SECTOR_SIZE;
        if whole > 0 {
            self.emit(&buf[..whole])?;
        }
        self.pending.extend_from_slice(&buf[whole..]);

        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `input` to `output` in sector-aligned writes
///
/// The final block is zero-padded to [`SECTOR_SIZE`]. Returns the number of
/// bytes written to `output`, padding included.
///
/// # Errors
///
/// Returns an error if reading or writing fails.
pub fn raw_write<R: Read, W: Write>(mut input: R, output: W, chunk_size: usize) -> Result<u64> {
    let mut sink = SectorWriter::new(output);
    let mut buffer = vec![0u8; chunk_size.max(SECTOR_SIZE)];

    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        sink.write_all(&buffer[..n])?;
    }

    let written = sink.finish()?;
    tracing::debug!("Raw write finished: {} bytes", written);
    Ok(written)
}

/// An open raw device
///
/// Holds whatever the platform needs kept alive while writing (volume locks
/// on Windows). Dropping it closes the device and releases those.
pub struct DeviceSink {
    file: File,
    held: Vec<Box<dyn Any + Send>>,
}

impl DeviceSink {
    /// Wrap an opened device file
    pub fn new(file: File) -> Self {
        Self {
            file,
            held: Vec::new(),
        }
    }

    /// Keep `guard` alive as long as the sink
    #[must_use]
    pub fn holding(mut self, guard: impl Any + Send) -> Self {
        self.held.push(Box::new(guard));
        self
    }

    /// Number of guards held
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Flush data to the device
    ///
    /// # Errors
    ///
    /// Returns an error if the OS flush fails.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Write for DeviceSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Platform operations interface
pub trait PlatformOps {
    /// Dismount every filesystem on a device before writing
    fn unmount_device(path: &str) -> Result<()>;

    /// Give a device back to the OS after a write (flush, rescan, remount)
    fn remount_device(path: &str) -> Result<()>;

    /// Check if running with elevated privileges
    fn has_elevated_privileges() -> bool;

    /// The privileged stage for writing `device`
    ///
    /// `self_exe` is the running `fleetflash` binary, for platforms that use
    /// its hidden `raw-write` subcommand as the sink.
    fn writer_command(device: &str, elevated: bool, self_exe: &str) -> WriterCommand;

    /// Open a device for raw writing
    fn open_device(path: &str) -> Result<DeviceSink>;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::LinuxPlatform as Platform;
    } else if #[cfg(target_os = "macos")] {
        mod macos;
        pub use macos::MacOSPlatform as Platform;
    } else if #[cfg(target_os = "windows")] {
        mod windows;
        pub use windows::WindowsPlatform as Platform;
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))] {
        /// Dismount every filesystem on a device
        ///
        /// # Errors
        ///
        /// Returns an error if a mounted filesystem cannot be released.
        pub fn unmount_device(path: &str) -> Result<()> {
            Platform::unmount_device(path)
        }

        /// Give a device back to the OS after a write
        ///
        /// # Errors
        ///
        /// Returns an error if the platform rescan or remount fails.
        pub fn remount_device(path: &str) -> Result<()> {
            Platform::remount_device(path)
        }

        /// Check if running with elevated privileges
        pub fn has_elevated_privileges() -> bool {
            Platform::has_elevated_privileges()
        }

        /// The privileged stage for writing `device`
        pub fn writer_command(device: &str, elevated: bool, self_exe: &str) -> WriterCommand {
            Platform::writer_command(device, elevated, self_exe)
        }

        /// Open a device for raw writing
        ///
        /// # Errors
        ///
        /// Returns an error if the device cannot be opened exclusively.
        pub fn open_device(path: &str) -> Result<DeviceSink> {
            Platform::open_device(path)
        }
    } else {
        /// Unmount a device (unsupported platform)
        pub fn unmount_device(_path: &str) -> Result<()> {
            Err(PlatformError::NotSupported("Platform not supported".to_string()))
        }

        /// Remount a device (unsupported platform)
        pub fn remount_device(_path: &str) -> Result<()> {
            Err(PlatformError::NotSupported("Platform not supported".to_string()))
        }

        /// Check privileges (unsupported platform)
        pub fn has_elevated_privileges() -> bool {
            false
        }

        /// Writer command (unsupported platform): plain `dd`
        pub fn writer_command(device: &str, _elevated: bool, _self_exe: &str) -> WriterCommand {
            WriterCommand::new("dd").arg(format!("of={device}"))
        }

        /// Open a device (unsupported platform)
        pub fn open_device(_path: &str) -> Result<DeviceSink> {
            Err(PlatformError::NotSupported("Platform not supported".to_string()))
        }
    }
}

/// Run a helper command, mapping a non-zero exit to `CommandFailed`
pub(crate) fn run_command(mut command: Command, what: &str) -> Result<()> {
    let output = command
        .output()
        .map_err(|e| PlatformError::CommandFailed(format!("Failed to run {what}: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(PlatformError::CommandFailed(format!(
            "{what} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
