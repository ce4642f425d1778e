//! Windows platform implementation
//!
//! Windows has no stdin-driven raw copy tool, so the privileged stage is the
//! `fleetflash raw-write` subcommand run from an elevated session. The sink
//! locks and dismounts every volume of the disk while it writes.

use crate::{run_command, DeviceSink, PlatformError, PlatformOps, Result, WriterCommand};
use std::fs::{File, OpenOptions};
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::process::Command;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_FLAG_WRITE_THROUGH, FILE_SHARE_READ, FILE_SHARE_WRITE,
};
use windows_sys::Win32::System::Ioctl::{
    FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

const PHYSICAL_DRIVE_PREFIX: &str = "\\\\.\\PHYSICALDRIVE";

/// Windows platform implementation
pub struct WindowsPlatform;

impl PlatformOps for WindowsPlatform {
    fn unmount_device(path: &str) -> Result<()> {
        let number = disk_number(path).ok_or_else(|| PlatformError::DeviceNotFound(path.to_string()))?;
        let script = format!(
            "Get-Partition -DiskNumber {number} | Where-Object DriveLetter | \
             ForEach-Object {{ Dismount-Volume -DriveLetter $_.DriveLetter -Force -Confirm:$false }}"
        );
        powershell(&script)
            .map(|_| ())
            .map_err(|e| PlatformError::UnmountFailed(e.to_string()))
    }

    fn remount_device(path: &str) -> Result<()> {
        let number = disk_number(path).ok_or_else(|| PlatformError::DeviceNotFound(path.to_string()))?;
        let mut command = Command::new("powershell");
        command.args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            &format!("Update-Disk -Number {number}"),
        ]);
        run_command(command, "Update-Disk")
    }

    fn has_elevated_privileges() -> bool {
        is_elevated()
    }

    fn writer_command(device: &str, _elevated: bool, self_exe: &str) -> WriterCommand {
        WriterCommand::new(self_exe)
            .arg("raw-write")
            .arg(normalize_windows_path(device))
    }

    fn open_device(path: &str) -> Result<DeviceSink> {
        let device_path = normalize_windows_path(path);
        let number = disk_number(&device_path)
            .ok_or_else(|| PlatformError::DeviceNotFound(device_path.clone()))?;

        let mut locks = Vec::new();
        for letter in volume_letters(number)? {
            locks.push(VolumeLock::acquire(letter)?);
        }

        let file = OpenOptions::new()
            .write(true)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .custom_flags(FILE_FLAG_WRITE_THROUGH)
            .open(&device_path)
            .map_err(|e| map_open_error(e, &device_path))?;

        tracing::debug!("Opened {} holding {} volume locks", device_path, locks.len());
        Ok(DeviceSink::new(file).holding(locks))
    }
}

/// An exclusive lock on a mounted volume, released on drop
pub(crate) struct VolumeLock {
    file: File,
    letter: char,
}

impl VolumeLock {
    /// Lock and dismount the volume at `letter`
    fn acquire(letter: char) -> Result<Self> {
        let path = format!("\\\\.\\{letter}:");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(&path)
            .map_err(|e| map_open_error(e, &path))?;

        let lock = Self { file, letter };
        lock.control(FSCTL_LOCK_VOLUME)
            .map_err(|_| PlatformError::DeviceBusy(format!("Failed to lock volume {letter}:")))?;
        lock.control(FSCTL_DISMOUNT_VOLUME)?;
        Ok(lock)
    }

    fn control(&self, code: u32) -> Result<()> {
        let mut bytes_returned: u32 = 0;
        let handle = self.file.as_raw_handle() as HANDLE;

        // SAFETY: the handle is owned by `self.file` and stays open for the
        // call; these control codes take no input or output buffers.
        #[allow(unsafe_code)]
        let result = unsafe {
            DeviceIoControl(
                handle,
                code,
                ptr::null(),
                0,
                ptr::null_mut(),
                0,
                &mut bytes_returned,
                ptr::null_mut(),
            )
        };

        if result == 0 {
            Err(PlatformError::Io(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        if let Err(e) = self.control(FSCTL_UNLOCK_VOLUME) {
            tracing::warn!("Failed to unlock volume {}: {}", self.letter, e);
        }
    }
}

fn map_open_error(error: std::io::Error, path: &str) -> PlatformError {
    match error.raw_os_error() {
        Some(5) => PlatformError::PermissionDenied(format!(
            "Cannot open {path}. Run as Administrator."
        )),
        Some(32) => PlatformError::DeviceBusy(format!(
            "{path} is in use. Close any programs using it."
        )),
        Some(2 | 3) => PlatformError::DeviceNotFound(path.to_string()),
        _ => PlatformError::Io(error),
    }
}

/// Run a PowerShell script and return stdout
fn powershell(script: &str) -> Result<String> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .map_err(|e| PlatformError::CommandFailed(format!("Failed to run PowerShell: {e}")))?;

    if !output.status.success() {
        return Err(PlatformError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Drive letters of the volumes on disk `number`
fn volume_letters(number: u32) -> Result<Vec<char>> {
    let script = format!(
        "Get-Partition -DiskNumber {number} | Where-Object DriveLetter | \
         ForEach-Object {{ $_.DriveLetter }}"
    );
    Ok(parse_volume_letters(&powershell(&script)?))
}

pub(crate) fn parse_volume_letters(output: &str) -> Vec<char> {
    output
        .lines()
        .filter_map(|line| {
            let mut chars = line.trim().chars();
            match (chars.next(), chars.next()) {
                (Some(c), None | Some(':')) if c.is_ascii_alphabetic() => {
                    Some(c.to_ascii_uppercase())
                }
                _ => None,
            }
        })
        .collect()
}

/// Converts various formats to the physical drive path:
/// - "1" or "PhysicalDrive1" -> "\\.\PHYSICALDRIVE1"
/// - "\\.\PhysicalDrive1" -> unchanged
pub(crate) fn normalize_windows_path(path: &str) -> String {
    if path.starts_with("\\\\.\\") {
        path.to_string()
    } else if path.to_ascii_uppercase().starts_with("PHYSICALDRIVE") {
        format!("\\\\.\\{path}")
    } else if let Ok(n) = path.parse::<u32>() {
        format!("{PHYSICAL_DRIVE_PREFIX}{n}")
    } else {
        path.to_string()
    }
}

/// Disk number of a physical drive path
pub(crate) fn disk_number(path: &str) -> Option<u32> {
    let normalized = normalize_windows_path(path).to_ascii_uppercase();
    normalized.strip_prefix(PHYSICAL_DRIVE_PREFIX)?.parse().ok()
}

/// Check if running with elevated privileges (Administrator)
fn is_elevated() -> bool {
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    // SAFETY: the token handle is checked before use and closed once; the
    // output buffer is a correctly sized TOKEN_ELEVATION.
    #[allow(unsafe_code)]
    unsafe {
        let mut token: HANDLE = 0;
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation: TOKEN_ELEVATION = std::mem::zeroed();
        let mut size: u32 = 0;

        let result = GetTokenInformation(
            token,
            TokenElevation,
            (&mut elevation as *mut TOKEN_ELEVATION).cast(),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        );

        CloseHandle(token);

        result != 0 && elevation.TokenIsElevated != 0
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Path normalization tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_windows_path() {
        assert_eq!(normalize_windows_path("2"), "\\\\.\\PHYSICALDRIVE2");
        assert_eq!(normalize_windows_path("PhysicalDrive1"), "\\\\.\\PhysicalDrive1");
        assert_eq!(
            normalize_windows_path("\\\\.\\PHYSICALDRIVE3"),
            "\\\\.\\PHYSICALDRIVE3"
        );
        assert_eq!(normalize_windows_path("E:"), "E:");
    }

    #[test]
    fn test_disk_number() {
        assert_eq!(disk_number("\\\\.\\PHYSICALDRIVE2"), Some(2));
        assert_eq!(disk_number("\\\\.\\PhysicalDrive10"), Some(10));
        assert_eq!(disk_number("3"), Some(3));
        assert_eq!(disk_number("E:"), None);
    }

    #[test]
    fn test_parse_volume_letters() {
        assert_eq!(parse_volume_letters("E\r\nf\r\n\r\n"), vec!['E', 'F']);
        assert_eq!(parse_volume_letters("G:\n"), vec!['G']);
        assert!(parse_volume_letters("").is_empty());
        assert!(parse_volume_letters("Error text\n").is_empty());
    }

    // -------------------------------------------------------------------------
    // Writer command tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_writer_command_uses_raw_write() {
        let cmd = WindowsPlatform::writer_command("2", true, "C:\\fleetflash\\fleetflash.exe");
        assert_eq!(cmd.program, "C:\\fleetflash\\fleetflash.exe");
        assert_eq!(cmd.args, vec!["raw-write", "\\\\.\\PHYSICALDRIVE2"]);
    }

    #[test]
    #[ignore = "requires Administrator and a physical drive"]
    fn test_open_physical_drive() {
        let result = WindowsPlatform::open_device("\\\\.\\PHYSICALDRIVE99");
        assert!(result.is_err());
    }
}
