//! Linux platform implementation
//!
//! Writes go through `dd`, elevated with `pkexec` when not already root.
//! Devices are opened with `O_EXCL` so a still-mounted card is refused.

use crate::{run_command, DeviceSink, PlatformError, PlatformOps, Result, WriterCommand};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::process::Command;

/// Linux platform implementation
pub struct LinuxPlatform;

impl PlatformOps for LinuxPlatform {
    fn unmount_device(path: &str) -> Result<()> {
        let mounts = std::fs::read_to_string("/proc/mounts").map_err(|e| {
            PlatformError::UnmountFailed(format!("Cannot read /proc/mounts: {e}"))
        })?;

        let targets = mounts_on_device(&mounts, path);
        for mount_point in &targets {
            tracing::debug!("Unmounting {} from {}", path, mount_point);
            let mut command = Command::new("umount");
            command.arg(mount_point);
            run_command(command, "umount")
                .map_err(|e| PlatformError::UnmountFailed(format!("{mount_point}: {e}")))?;
        }

        if !targets.is_empty() {
            // Let udev settle before the device is opened
            std::thread::sleep(std::time::Duration::from_millis(100));
        }

        Ok(())
    }

    fn remount_device(path: &str) -> Result<()> {
        // The desktop automounter picks the new partitions up on its own
        tracing::debug!("Flushing after write to {}", path);
        run_command(Command::new("sync"), "sync")
    }

    fn has_elevated_privileges() -> bool {
        // SAFETY: geteuid() has no preconditions and cannot fail.
        #[allow(unsafe_code)]
        unsafe {
            libc::geteuid() == 0
        }
    }

    fn writer_command(device: &str, elevated: bool, _self_exe: &str) -> WriterCommand {
        dd_command(device, elevated)
    }

    fn open_device(path: &str) -> Result<DeviceSink> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    PlatformError::PermissionDenied(format!("Cannot open {path}. Run as root."))
                }
                io::ErrorKind::NotFound => PlatformError::DeviceNotFound(path.to_string()),
                _ if e.raw_os_error() == Some(libc::EBUSY) => {
                    PlatformError::DeviceBusy(format!("{path} is mounted or in use"))
                }
                _ => PlatformError::Io(e),
            })?;

        Ok(DeviceSink::new(file))
    }
}

/// `dd` writing stdin to `device`, behind `pkexec` unless already root
pub(crate) fn dd_command(device: &str, elevated: bool) -> WriterCommand {
    let base = if elevated {
        WriterCommand::new("dd")
    } else {
        WriterCommand::new("pkexec").arg("dd")
    };

    base.arg(format!("of={device}"))
        .arg("bs=4M")
        .arg("conv=fsync")
        .arg("status=none")
}

/// Mount points in `/proc/mounts` content whose source is `device` or one of
/// its partitions
pub(crate) fn mounts_on_device(mounts: &str, device: &str) -> Vec<String> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let source = parts.next()?;
            let mount_point = parts.next()?;
            is_on_device(source, device).then(|| mount_point.replace("\\040", " "))
        })
        .collect()
}

/// `/dev/sdb`, `/dev/sdb1` and `/dev/mmcblk0p2` are on their base device;
/// `/dev/sdbb` is not on `/dev/sdb`
pub(crate) fn is_on_device(source: &str, device: &str) -> bool {
    let Some(rest) = source.strip_prefix(device) else {
        return false;
    };
    let digits = rest.strip_prefix('p').unwrap_or(rest);
    rest.is_empty() || (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/nvme0n1p1 /boot/efi vfat rw 0 0
/dev/sdb1 /media/user/BOOT vfat rw,nosuid 0 0
/dev/sdb2 /media/user/my\\040root ext4 rw,nosuid 0 0
/dev/sdbb1 /mnt/other ext4 rw 0 0
/dev/mmcblk0p1 /media/user/SKYBIAN vfat rw 0 0
tmpfs /tmp tmpfs rw 0 0
";

    // -------------------------------------------------------------------------
    // Mount matching tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_is_on_device() {
        assert!(is_on_device("/dev/sdb", "/dev/sdb"));
        assert!(is_on_device("/dev/sdb1", "/dev/sdb"));
        assert!(is_on_device("/dev/mmcblk0p2", "/dev/mmcblk0"));
        assert!(!is_on_device("/dev/sdbb1", "/dev/sdb"));
        assert!(!is_on_device("/dev/sda1", "/dev/sdb"));
        assert!(!is_on_device("/dev/mmcblk0p", "/dev/mmcblk0"));
    }

    #[test]
    fn test_mounts_on_device() {
        assert_eq!(
            mounts_on_device(MOUNTS, "/dev/sdb"),
            vec!["/media/user/BOOT", "/media/user/my root"]
        );
        assert_eq!(
            mounts_on_device(MOUNTS, "/dev/mmcblk0"),
            vec!["/media/user/SKYBIAN"]
        );
        assert!(mounts_on_device(MOUNTS, "/dev/sdc").is_empty());
    }

    // -------------------------------------------------------------------------
    // Writer command tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_dd_command_unprivileged() {
        assert_eq!(
            dd_command("/dev/sdb", false).to_string(),
            "pkexec dd of=/dev/sdb bs=4M conv=fsync status=none"
        );
    }

    #[test]
    fn test_dd_command_as_root() {
        let cmd = LinuxPlatform::writer_command("/dev/mmcblk0", true, "/usr/bin/fleetflash");
        assert_eq!(cmd.program, "dd");
        assert_eq!(cmd.args[0], "of=/dev/mmcblk0");
    }

    // -------------------------------------------------------------------------
    // Device access tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_open_nonexistent_device() {
        let result = LinuxPlatform::open_device("/dev/fleetflash-nonexistent");
        assert!(matches!(result, Err(PlatformError::DeviceNotFound(_))));
    }

    #[test]
    fn test_open_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let sink = LinuxPlatform::open_device(&path).unwrap();
        assert_eq!(sink.held(), 0);
    }

    #[test]
    fn test_unmount_unmounted_device_is_noop() {
        assert!(LinuxPlatform::unmount_device("/dev/fleetflash-nonexistent").is_ok());
    }

    #[test]
    fn test_has_elevated_privileges() {
        // SAFETY: geteuid() has no preconditions.
        #[allow(unsafe_code)]
        let is_root = unsafe { libc::geteuid() == 0 };
        assert_eq!(LinuxPlatform::has_elevated_privileges(), is_root);
    }
}
