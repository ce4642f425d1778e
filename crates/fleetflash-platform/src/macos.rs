//! macOS platform implementation
//!
//! Writes go to the raw node (`/dev/rdiskN`) through `authopen`, which asks
//! for administrator rights itself. `diskutil` unmounts and remounts.

use crate::{run_command, DeviceSink, PlatformError, PlatformOps, Result, WriterCommand};
use std::fs::OpenOptions;
use std::io;
use std::process::Command;

/// Path of the macOS authorization helper
const AUTHOPEN: &str = "/usr/libexec/authopen";

/// macOS platform implementation
pub struct MacOSPlatform;

impl PlatformOps for MacOSPlatform {
    fn unmount_device(path: &str) -> Result<()> {
        let disk = to_block_device_path(path);
        tracing::debug!("Unmounting disk: {}", disk);

        let output = Command::new("diskutil")
            .args(["unmountDisk", &disk])
            .output()
            .map_err(|e| PlatformError::CommandFailed(format!("Failed to run diskutil: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || is_already_unmounted(&stdout, &stderr) {
            std::thread::sleep(std::time::Duration::from_millis(100));
            return Ok(());
        }

        Err(PlatformError::UnmountFailed(format!(
            "diskutil unmountDisk failed: {} {}",
            stdout.trim(),
            stderr.trim()
        )))
    }

    fn remount_device(path: &str) -> Result<()> {
        let mut command = Command::new("diskutil");
        command.args(["mountDisk", &to_block_device_path(path)]);
        run_command(command, "diskutil mountDisk")
    }

    fn has_elevated_privileges() -> bool {
        // SAFETY: geteuid() has no preconditions and cannot fail.
        #[allow(unsafe_code)]
        unsafe {
            libc::geteuid() == 0
        }
    }

    fn writer_command(device: &str, elevated: bool, _self_exe: &str) -> WriterCommand {
        let raw = to_raw_device_path(device);
        if elevated {
            WriterCommand::new("dd").arg(format!("of={raw}")).arg("bs=4m")
        } else {
            WriterCommand::new(AUTHOPEN).arg("-w").arg(raw)
        }
    }

    fn open_device(path: &str) -> Result<DeviceSink> {
        let raw = to_raw_device_path(path);
        let file = OpenOptions::new()
            .write(true)
            .open(&raw)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    PlatformError::PermissionDenied(format!("Cannot open {raw}. Run with sudo."))
                }
                io::ErrorKind::NotFound => PlatformError::DeviceNotFound(raw.clone()),
                _ if e.raw_os_error() == Some(libc::EBUSY) => PlatformError::DeviceBusy(format!(
                    "{raw} is busy. Try running: diskutil unmountDisk {path}"
                )),
                _ => PlatformError::Io(e),
            })?;

        Ok(DeviceSink::new(file))
    }
}

/// /dev/disk2 -> /dev/rdisk2
pub(crate) fn to_raw_device_path(path: &str) -> String {
    if path.starts_with("/dev/disk") {
        path.replacen("/dev/disk", "/dev/rdisk", 1)
    } else {
        path.to_string()
    }
}

/// /dev/rdisk2 -> /dev/disk2
pub(crate) fn to_block_device_path(path: &str) -> String {
    if path.starts_with("/dev/rdisk") {
        path.replacen("/dev/rdisk", "/dev/disk", 1)
    } else {
        path.to_string()
    }
}

/// diskutil reports a card without mounted volumes as a failure
fn is_already_unmounted(stdout: &str, stderr: &str) -> bool {
    stdout.contains("was already unmounted")
        || stdout.contains("Unmount of all volumes")
        || stderr.contains("not currently mounted")
}

// ============================================================================
// UNIT TESTS
// ============================================================================
