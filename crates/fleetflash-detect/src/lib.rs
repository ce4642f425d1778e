//! # Fleetflash Detect
//!
//! Removable card enumeration with system drive protection.
//!
//! Every platform backend answers the same question: which block devices
//! could receive a node image right now, how large are they and what are they
//! called. The answer is polled often while the user swaps cards, so the
//! backends only read cheap sources (`/sys/block`, `diskutil`, CIM queries).
//!
//! ## Safety
//!
//! A drive is never offered as a target when:
//! - it holds a mount point like `/`, `/home` or `C:\`
//! - it is a non-removable internal drive
//! - the platform flags it as a boot or system image device
//!
//! When in doubt a drive is marked as system and filtered out.

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Drive detection errors
#[derive(Error, Debug)]
pub enum DetectError {
    /// Failed to enumerate drives
    #[error("Failed to enumerate drives: {0}")]
    EnumerationFailed(String),

    /// The named device is not present
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The named device must not be written
    #[error("Refusing to use {path}: {reason}")]
    UnsafeTarget {
        /// Device path
        path: String,
        /// Why it was refused
        reason: String,
    },

    /// Platform not supported
    #[error("Platform not supported")]
    UnsupportedPlatform,

    /// Command execution failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Failed to parse drive information
    #[error("Parse error: {0}")]
    ParseError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for drive detection operations
pub type Result<T> = std::result::Result<T, DetectError>;

/// A detected block device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    /// Device identifier (`/dev/sdb`, `/dev/disk2`, `\\.\PHYSICALDRIVE1`)
    pub path: String,

    /// Path used for the raw write (`/dev/rdisk2` on macOS, else `path`)
    pub raw_path: String,

    /// Volume label of the drive or its first labeled partition
    pub label: Option<String>,

    /// Vendor/model string if available
    pub model: Option<String>,

    /// Size in bytes
    pub size: u64,

    /// Whether the drive reports removable media
    pub removable: bool,

    /// Whether this appears to be a system drive
    pub is_system: bool,

    /// Why this drive was marked as system
    pub system_reason: Option<String>,

    /// Mount points of its partitions
    pub mount_points: Vec<String>,

    /// Partitions found on the drive
    pub partitions: Vec<Partition>,
}

/// A partition on a drive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition path (e.g., /dev/sdb1, E:)
    pub path: String,

    /// Volume label if available
    pub label: Option<String>,

    /// Size in bytes
    pub size: u64,

    /// Mount point if mounted
    pub mount_point: Option<String>,
}

impl Drive {
    /// Create a new Drive with the given path
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            raw_path: path.clone(),
            path,
            ..Default::default()
        }
    }

    /// Builder: set the label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Builder: set the size
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Builder: set removable flag
    #[must_use]
    pub fn with_removable(mut self, removable: bool) -> Self {
        self.removable = removable;
        self
    }

    /// Builder: set system flag
    #[must_use]
    pub fn with_system(mut self, is_system: bool, reason: Option<String>) -> Self {
        self.is_system = is_system;
        self.system_reason = reason;
        self
    }

    /// Builder: add a partition (its mount point is recorded too)
    #[must_use]
    pub fn with_partition(mut self, partition: Partition) -> Self {
        if let Some(mp) = &partition.mount_point {
            self.mount_points.push(mp.clone());
        }
        self.partitions.push(partition);
        self
    }

    /// Check if this drive may receive an image
    #[must_use]
    pub fn is_safe_target(&self) -> bool {
        self.removable && !self.is_system
    }

    /// Human label: the drive label, else the first labeled partition
    ///
    /// `None` means the card is unlabeled or not mounted.
    #[must_use]
    pub fn volume_label(&self) -> Option<&str> {
        self.label
            .as_deref()
            .or_else(|| self.partitions.iter().find_map(|p| p.label.as_deref()))
            .map(str::trim)
            .filter(|l| !l.is_empty())
    }

    /// Format size for human-readable display
    #[must_use]
    pub fn size_display(&self) -> String {
        format_bytes(self.size)
    }
}

/// Format bytes into human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// System mount points that indicate a system drive
pub const SYSTEM_MOUNT_POINTS: &[&str] = &[
    "/",
    "/boot",
    "/boot/efi",
    "/home",
    "/usr",
    "/var",
    "/etc",
    "/System",
    "/Applications",
    "/Library",
    "C:",
    "C:\\",
    "C:\\Windows",
];

/// Check if a mount point belongs to the running system
#[must_use]
pub fn is_system_mount_point(mount_point: &str) -> bool {
    let normalized = mount_point.trim();

    SYSTEM_MOUNT_POINTS.iter().any(|&sys| {
        normalized.eq_ignore_ascii_case(sys)
            || (sys != "/" && normalized.starts_with(&format!("{sys}/")))
            || normalized.starts_with(&format!("{sys}\\"))
    })
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::list_drives;
    } else if #[cfg(target_os = "macos")] {
        mod macos;
        pub use macos::list_drives;
    } else if #[cfg(target_os = "windows")] {
        mod windows;
        pub use windows::list_drives;
    } else {
        /// List drives (unsupported platform)
        pub fn list_drives() -> Result<Vec<Drive>> {
            Err(DetectError::UnsupportedPlatform)
        }
    }
}

/// List the removable cards an image may be written to
///
/// No card present is an empty list, not an error.
///
/// # Errors
///
/// Returns an error if the platform source cannot be read at all.
pub fn list_removable_drives() -> Result<Vec<Drive>> {
    Ok(filter_targets(list_drives()?))
}

/// List all drives including system drives
///
/// # Errors
///
/// Returns an error if drive enumeration fails (see [`list_drives`]).
pub fn list_all_drives() -> Result<Vec<Drive>> {
    list_drives()
}

/// Keep only drives that are safe targets, ordered by path
#[must_use]
pub fn filter_targets(drives: Vec<Drive>) -> Vec<Drive> {
    let mut targets: Vec<Drive> = drives.into_iter().filter(Drive::is_safe_target).collect();
    targets.sort_by(|a, b| a.path.cmp(&b.path));
    targets
}

/// Find `device_path` in `drives` and check it is safe to write
///
/// # Errors
///
/// Returns [`DetectError::NotFound`] or [`DetectError::UnsafeTarget`].
pub fn check_target(drives: Vec<Drive>, device_path: &str) -> Result<Drive> {
    let drive = drives
        .into_iter()
        .find(|d| d.path == device_path || d.raw_path == device_path)
        .ok_or_else(|| DetectError::NotFound(device_path.to_string()))?;

    if drive.is_system {
        return Err(DetectError::UnsafeTarget {
            path: device_path.to_string(),
            reason: drive
                .system_reason
                .clone()
                .unwrap_or_else(|| "system drive detected".to_string()),
        });
    }

    if !drive.removable {
        return Err(DetectError::UnsafeTarget {
            path: device_path.to_string(),
            reason: "drive is not removable".to_string(),
        });
    }

    Ok(drive)
}

/// Validate that a device path is a safe target on this machine
///
/// # Errors
///
/// Returns an error if enumeration fails, the device is missing, or it is a
/// system or fixed drive.
pub fn validate_target(device_path: &str) -> Result<Drive> {
    check_target(list_drives()?, device_path)
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn card(path: &str) -> Drive {
        Drive::new(path).with_size(8 << 30).with_removable(true)
    }

    // -------------------------------------------------------------------------
    // format_bytes tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100.0 MB");
        assert_eq!(format_bytes(8 << 30), "8.0 GB");
        assert_eq!(format_bytes(2 << 40), "2.0 TB");
    }

    // -------------------------------------------------------------------------
    // System mount point tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_system_mount_points() {
        assert!(is_system_mount_point("/"));
        assert!(is_system_mount_point("/boot/efi"));
        assert!(is_system_mount_point("/home/user"));
        assert!(is_system_mount_point("/System/Volumes/Data"));
        assert!(is_system_mount_point("C:"));
        assert!(is_system_mount_point("c:\\windows"));
    }

    #[test]
    fn test_non_system_mount_points() {
        assert!(!is_system_mount_point("/media/user/boot"));
        assert!(!is_system_mount_point("/mnt/card"));
        assert!(!is_system_mount_point("/Volumes/SKYBIAN"));
        assert!(!is_system_mount_point("E:"));
        assert!(!is_system_mount_point(""));
    }

    // -------------------------------------------------------------------------
    // Drive tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_drive_new() {
        let drive = Drive::new("/dev/sdb");
        assert_eq!(drive.raw_path, "/dev/sdb");
        assert_eq!(drive.size, 0);
        assert!(!drive.is_safe_target());
    }

    #[test]
    fn test_drive_is_safe_target() {
        assert!(card("/dev/sdb").is_safe_target());
        assert!(!card("/dev/sdb")
            .with_system(true, Some("Boot device".to_string()))
            .is_safe_target());
        assert!(!card("/dev/sda").with_removable(false).is_safe_target());
    }

    #[test]
    fn test_volume_label_from_partition() {
        let drive = card("/dev/sdb")
            .with_partition(Partition {
                path: "/dev/sdb1".to_string(),
                label: None,
                size: 1 << 20,
                mount_point: None,
            })
            .with_partition(Partition {
                path: "/dev/sdb2".to_string(),
                label: Some("SKYBIAN".to_string()),
                size: 1 << 30,
                mount_point: Some("/media/user/SKYBIAN".to_string()),
            });

        assert_eq!(drive.volume_label(), Some("SKYBIAN"));
        assert_eq!(drive.mount_points, vec!["/media/user/SKYBIAN".to_string()]);
    }

    #[test]
    fn test_volume_label_prefers_drive_label() {
        let drive = card("/dev/disk4").with_label("CARD").with_partition(Partition {
            label: Some("BOOT".to_string()),
            ..Default::default()
        });
        assert_eq!(drive.volume_label(), Some("CARD"));
    }

    #[test]
    fn test_volume_label_blank_is_none() {
        assert_eq!(card("/dev/sdb").with_label("  ").volume_label(), None);
        assert_eq!(card("/dev/sdb").volume_label(), None);
    }

    #[test]
    fn test_drive_serialization() {
        let drive = card("/dev/sdc").with_label("NODE");
        let json = serde_json::to_string(&drive).unwrap();
        let back: Drive = serde_json::from_str(&json).unwrap();
        assert_eq!(back, drive);
    }

    // -------------------------------------------------------------------------
    // Target filtering tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_filter_targets_sorted_and_safe() {
        let drives = vec![
            card("/dev/sdc"),
            card("/dev/sda").with_removable(false),
            card("/dev/mmcblk0"),
            card("/dev/sdb").with_system(true, None),
        ];
        let paths: Vec<String> = filter_targets(drives).into_iter().map(|d| d.path).collect();
        assert_eq!(paths, vec!["/dev/mmcblk0", "/dev/sdc"]);
    }

    #[test]
    fn test_filter_targets_empty() {
        assert!(filter_targets(Vec::new()).is_empty());
    }

    #[test]
    fn test_check_target_found() {
        let drive = check_target(vec![card("/dev/sdb")], "/dev/sdb").unwrap();
        assert_eq!(drive.path, "/dev/sdb");
    }

    #[test]
    fn test_check_target_by_raw_path() {
        let mut drive = card("/dev/disk4");
        drive.raw_path = "/dev/rdisk4".to_string();
        assert!(check_target(vec![drive], "/dev/rdisk4").is_ok());
    }

    #[test]
    fn test_check_target_missing() {
        let err = check_target(vec![card("/dev/sdb")], "/dev/sdz").unwrap_err();
        assert!(matches!(err, DetectError::NotFound(ref p) if p == "/dev/sdz"));
    }

    #[test]
    fn test_check_target_system_refused() {
        let drives = vec![card("/dev/sda").with_system(true, Some("Contains /".to_string()))];
        let err = check_target(drives, "/dev/sda").unwrap_err();
        assert_eq!(err.to_string(), "Refusing to use /dev/sda: Contains /");
    }

    #[test]
    fn test_check_target_fixed_refused() {
        let err = check_target(vec![card("/dev/sda").with_removable(false)], "/dev/sda")
            .unwrap_err();
        assert!(matches!(err, DetectError::UnsafeTarget { .. }));
    }

    // -------------------------------------------------------------------------
    // Error tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_error_display() {
        assert_eq!(
            DetectError::EnumerationFailed("/sys/block not found".to_string()).to_string(),
            "Failed to enumerate drives: /sys/block not found"
        );
        assert_eq!(
            DetectError::UnsupportedPlatform.to_string(),
            "Platform not supported"
        );
    }
}
