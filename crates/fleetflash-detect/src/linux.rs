//! Linux drive detection implementation
//!
//! Uses /sys/block for device enumeration, /proc/mounts for mount points and
//! /dev/disk/by-label for volume labels.

use super::{is_system_mount_point, DetectError, Drive, Partition, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// List all drives on Linux
///
/// # Errors
///
/// Returns an error if `/sys/block` or `/proc/mounts` cannot be read.
pub fn list_drives() -> Result<Vec<Drive>> {
    let block_dir = Path::new("/sys/block");
    if !block_dir.exists() {
        return Err(DetectError::EnumerationFailed(
            "/sys/block not found".to_string(),
        ));
    }

    let mount_map = get_mount_points()?;
    let label_map = get_labels(Path::new("/dev/disk/by-label"));

    let mut drives = Vec::new();
    for entry in fs::read_dir(block_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        if should_skip_device(&name) {
            continue;
        }

        if let Some(drive) = parse_block_device(block_dir, &name, &mount_map, &label_map) {
            drives.push(drive);
        }
    }

    tracing::debug!("Found {} block devices", drives.len());
    Ok(drives)
}

/// Check if a device should be skipped
pub(crate) fn should_skip_device(name: &str) -> bool {
    name.starts_with("loop")
        || name.starts_with("ram")
        || name.starts_with("dm-")
        || name.starts_with("zram")
        || name.starts_with("sr")  // CD/DVD drives
        || name.starts_with("fd")  // Floppy drives
        || name.starts_with("md")  // Software RAID
        || (name.starts_with("mmcblk") && name.contains("boot")) // eMMC boot areas
}

/// Whether the device counts as removable
///
/// Built-in SD readers on the MMC bus report `removable = 0`, so `mmcblk`
/// devices are taken as removable unless they are on-board eMMC.
pub(crate) fn is_removable(name: &str, removable_flag: bool, onboard_emmc: bool) -> bool {
    removable_flag || (name.starts_with("mmcblk") && !onboard_emmc)
}

/// Whether an `mmcblk` device is soldered eMMC rather than an SD card
///
/// eMMC reports `device/type = MMC` and exposes `<name>boot0` hardware
/// boot partitions next to itself; SD cards have neither.
pub(crate) fn is_onboard_emmc(sys_root: &Path, name: &str) -> bool {
    if !name.starts_with("mmcblk") {
        return false;
    }
    let card_type = read_sys_value(&sys_root.join(name).join("device/type"));
    card_type.as_deref() == Some("MMC") || sys_root.join(format!("{name}boot0")).exists()
}

/// Parse one block device under `sys_root`
pub(crate) fn parse_block_device(
    sys_root: &Path,
    name: &str,
    mount_map: &HashMap<String, String>,
    label_map: &HashMap<String, String>,
) -> Option<Drive> {
    let sys_path = sys_root.join(name);
    let dev_path = format!("/dev/{name}");

    if !sys_path.exists() {
        return None;
    }

    let size = read_sectors(&sys_path.join("size"));
    if size == 0 {
        // Empty card reader slot
        return None;
    }

    let removable_flag = read_sys_value(&sys_path.join("removable"))
        .is_some_and(|s| s == "1");
    let removable = is_removable(name, removable_flag, is_onboard_emmc(sys_root, name));

    let vendor = read_sys_value(&sys_path.join("device/vendor"));
    let model = read_sys_value(&sys_path.join("device/model"));
    let model = match (vendor, model) {
        (Some(v), Some(m)) => Some(format!("{v} {m}")),
        (v, m) => m.or(v),
    };

    let partitions = get_partitions(&sys_path, name, mount_map, label_map);
    let mut mount_points: Vec<String> = partitions
        .iter()
        .filter_map(|p| p.mount_point.clone())
        .collect();
    if let Some(mp) = mount_map.get(&dev_path) {
        mount_points.push(mp.clone());
    }

    let (is_system, system_reason) = check_if_system_drive(&mount_points, removable);

    Some(Drive {
        path: dev_path.clone(),
        raw_path: dev_path.clone(),
        label: label_map.get(&dev_path).cloned(),
        model,
        size,
        removable,
        is_system,
        system_reason,
        mount_points,
        partitions,
    })
}

/// Read device -> mount point from /proc/mounts
///
/// # Errors
///
/// Returns an error if `/proc/mounts` cannot be read.
pub(crate) fn get_mount_points() -> Result<HashMap<String, String>> {
    let content = fs::read_to_string("/proc/mounts")
        .map_err(|e| DetectError::EnumerationFailed(format!("Failed to read /proc/mounts: {e}")))?;

    Ok(content.lines().filter_map(parse_mount_line).collect())
}

/// Parse a single line from /proc/mounts
///
/// Format: device `mount_point` filesystem options dump pass. Only lines
/// whose source is a `/dev` node are kept.
pub(crate) fn parse_mount_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let device = parts.next()?;
    let mount_point = parts.next()?;
    parts.next()?;

    if !device.starts_with("/dev/") {
        return None;
    }

    Some((device.to_string(), decode_mount_escapes(mount_point)))
}

/// Undo the octal escapes /proc/mounts uses for spaces and tabs
fn decode_mount_escapes(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\134", "\\")
}

/// Read labels from a by-label directory
///
/// Returns a map of device path -> label
pub(crate) fn get_labels(label_dir: &Path) -> HashMap<String, String> {
    let mut labels = HashMap::new();

    let Ok(entries) = fs::read_dir(label_dir) else {
        return labels;
    };

    for entry in entries.flatten() {
        let label = decode_label(&entry.file_name().to_string_lossy());

        // Target is usually something like "../../sdb1"
        if let Ok(target) = fs::read_link(entry.path()) {
            if let Some(device_name) = target.file_name() {
                labels.insert(format!("/dev/{}", device_name.to_string_lossy()), label);
            }
        }
    }

    labels
}

/// Decode udev label escapes (`\x20` for space)
pub(crate) fn decode_label(label: &str) -> String {
    let mut result = String::new();
    let mut chars = label.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'x') {
            chars.next();
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                result.push(char::from(byte));
            } else {
                result.push_str("\\x");
                result.push_str(&hex);
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Partitions are the `/sys/block/<dev>/<dev>N` (or `<dev>pN`) children
fn get_partitions(
    sys_path: &Path,
    device_name: &str,
    mount_map: &HashMap<String, String>,
    label_map: &HashMap<String, String>,
) -> Vec<Partition> {
    let mut partitions = Vec::new();

    let Ok(entries) = fs::read_dir(sys_path) else {
        return partitions;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(device_name) || name == device_name {
            continue;
        }

        let part_path = format!("/dev/{name}");
        partitions.push(Partition {
            size: read_sectors(&entry.path().join("size")),
            label: label_map.get(&part_path).cloned(),
            mount_point: mount_map.get(&part_path).cloned(),
            path: part_path,
        });
    }

    partitions.sort_by(|a, b| a.path.cmp(&b.path));
    partitions
}

/// Check if a drive is a system drive
pub(crate) fn check_if_system_drive(
    mount_points: &[String],
    removable: bool,
) -> (bool, Option<String>) {
    for mp in mount_points {
        if is_system_mount_point(mp) {
            return (true, Some(format!("Contains system mount point: {mp}")));
        }
    }

    if !removable {
        return (true, Some("Non-removable internal drive".to_string()));
    }

    (false, None)
}

/// Size file in 512-byte sectors, as bytes
fn read_sectors(path: &Path) -> u64 {
    read_sys_value(path)
        .and_then(|s| s.parse::<u64>().ok())
        .map_or(0, |sectors| sectors * 512)
}

/// Read a trimmed, non-empty value from sysfs
fn read_sys_value(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Lay out a fake `/sys/block/<name>` tree
    fn fake_device(root: &Path, name: &str, sectors: u64, removable: &str, parts: &[&str]) {
        let dev = root.join(name);
        fs::create_dir_all(dev.join("device")).unwrap();
        fs::write(dev.join("size"), format!("{sectors}\n")).unwrap();
        fs::write(dev.join("removable"), format!("{removable}\n")).unwrap();
        fs::write(dev.join("device/vendor"), "Generic \n").unwrap();
        fs::write(dev.join("device/model"), "STORAGE DEVICE  \n").unwrap();
        for part in parts {
            fs::create_dir_all(dev.join(part)).unwrap();
            fs::write(dev.join(part).join("size"), "2048\n").unwrap();
        }
    }

    // -------------------------------------------------------------------------
    // should_skip_device tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_should_skip_virtual_devices() {
        for name in ["loop0", "ram15", "dm-1", "zram0", "sr0", "fd0", "md127"] {
            assert!(should_skip_device(name), "{name}");
        }
    }

    #[test]
    fn test_should_skip_emmc_boot_areas() {
        assert!(should_skip_device("mmcblk0boot0"));
        assert!(should_skip_device("mmcblk0boot1"));
    }

    #[test]
    fn test_should_not_skip_real_devices() {
        for name in ["sda", "sdb", "nvme0n1", "mmcblk0", "vda"] {
            assert!(!should_skip_device(name), "{name}");
        }
    }

    // -------------------------------------------------------------------------
    // is_removable tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_is_removable() {
        assert!(is_removable("sdb", true, false));
        assert!(is_removable("mmcblk0", false, false));
        assert!(!is_removable("mmcblk0", false, true));
        assert!(!is_removable("sda", false, false));
        assert!(!is_removable("nvme0n1", false, false));
    }

    #[test]
    fn test_onboard_emmc_detection() {
        let dir = TempDir::new().unwrap();
        fake_device(dir.path(), "mmcblk0", 1024, "0", &[]);
        fs::write(dir.path().join("mmcblk0/device/type"), "SD\n").unwrap();
        fake_device(dir.path(), "mmcblk1", 1024, "0", &[]);
        fs::write(dir.path().join("mmcblk1/device/type"), "MMC\n").unwrap();
        fake_device(dir.path(), "mmcblk2", 1024, "0", &[]);
        fs::create_dir_all(dir.path().join("mmcblk2boot0")).unwrap();

        assert!(!is_onboard_emmc(dir.path(), "mmcblk0"));
        assert!(is_onboard_emmc(dir.path(), "mmcblk1"));
        assert!(is_onboard_emmc(dir.path(), "mmcblk2"));
        assert!(!is_onboard_emmc(dir.path(), "sda"));
    }

    // -------------------------------------------------------------------------
    // parse_mount_line tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_mount_line_basic() {
        let (device, mp) = parse_mount_line("/dev/sda1 / ext4 rw,relatime 0 0").unwrap();
        assert_eq!(device, "/dev/sda1");
        assert_eq!(mp, "/");
    }

    #[test]
    fn test_parse_mount_line_with_spaces() {
        let (device, mp) = parse_mount_line("/dev/sdb1 /media/my\\040card vfat rw 0 0").unwrap();
        assert_eq!(device, "/dev/sdb1");
        assert_eq!(mp, "/media/my card");
    }

    #[test]
    fn test_parse_mount_line_pseudo_fs_skipped() {
        assert!(parse_mount_line("tmpfs /tmp tmpfs rw,nosuid,nodev 0 0").is_none());
        assert!(parse_mount_line("proc /proc proc rw 0 0").is_none());
    }

    #[test]
    fn test_parse_mount_line_short() {
        assert!(parse_mount_line("").is_none());
        assert!(parse_mount_line("/dev/sda1").is_none());
        assert!(parse_mount_line("/dev/sda1 /").is_none());
    }

    // -------------------------------------------------------------------------
    // Label tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_decode_label() {
        assert_eq!(decode_label("SKYBIAN"), "SKYBIAN");
        assert_eq!(decode_label("My\\x20Card"), "My Card");
        assert_eq!(decode_label("A\\x20B\\x20C"), "A B C");
        assert_eq!(decode_label("Test\\xZZ"), "Test\\xZZ");
    }

    #[cfg(unix)]
    #[test]
    fn test_get_labels_resolves_symlinks() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("../../sdb1", dir.path().join("BOOT\\x20FS")).unwrap();
        std::os::unix::fs::symlink("../../mmcblk0p2", dir.path().join("rootfs")).unwrap();

        let labels = get_labels(dir.path());
        assert_eq!(labels.get("/dev/sdb1").map(String::as_str), Some("BOOT FS"));
        assert_eq!(labels.get("/dev/mmcblk0p2").map(String::as_str), Some("rootfs"));
    }

    #[test]
    fn test_get_labels_missing_dir() {
        assert!(get_labels(Path::new("/nonexistent/by-label")).is_empty());
    }

    // -------------------------------------------------------------------------
    // check_if_system_drive tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_system_drive_by_mount() {
        let (is_system, reason) = check_if_system_drive(&["/".to_string()], true);
        assert!(is_system);
        assert!(reason.unwrap().contains("system mount point"));
    }

    #[test]
    fn test_system_drive_non_removable() {
        let (is_system, reason) = check_if_system_drive(&[], false);
        assert!(is_system);
        assert_eq!(reason.as_deref(), Some("Non-removable internal drive"));
    }

    #[test]
    fn test_removable_card_not_system() {
        let (is_system, reason) =
            check_if_system_drive(&["/media/user/SKYBIAN".to_string()], true);
        assert!(!is_system);
        assert!(reason.is_none());
    }

    // -------------------------------------------------------------------------
    // parse_block_device tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_block_device_sd_card() {
        let dir = TempDir::new().unwrap();
        fake_device(dir.path(), "mmcblk0", 15_523_840, "0", &["mmcblk0p1", "mmcblk0p2"]);

        let mounts = HashMap::from([(
            "/dev/mmcblk0p1".to_string(),
            "/media/user/BOOT".to_string(),
        )]);
        let labels = HashMap::from([("/dev/mmcblk0p1".to_string(), "BOOT".to_string())]);

        let drive = parse_block_device(dir.path(), "mmcblk0", &mounts, &labels).unwrap();
        assert_eq!(drive.path, "/dev/mmcblk0");
        assert_eq!(drive.size, 15_523_840 * 512);
        assert!(drive.removable);
        assert!(drive.is_safe_target());
        assert_eq!(drive.volume_label(), Some("BOOT"));
        assert_eq!(drive.model.as_deref(), Some("Generic STORAGE DEVICE"));
        assert_eq!(drive.partitions.len(), 2);
        assert_eq!(drive.partitions[1].size, 2048 * 512);
        assert_eq!(drive.mount_points, vec!["/media/user/BOOT".to_string()]);
    }

    #[test]
    fn test_parse_block_device_onboard_emmc_not_offered() {
        let dir = TempDir::new().unwrap();
        fake_device(dir.path(), "mmcblk0", 30_535_680, "0", &["mmcblk0p1"]);
        fs::write(dir.path().join("mmcblk0/device/type"), "MMC\n").unwrap();
        fs::create_dir_all(dir.path().join("mmcblk0boot0")).unwrap();

        let drive = parse_block_device(dir.path(), "mmcblk0", &HashMap::new(), &HashMap::new())
            .unwrap();
        assert!(!drive.removable);
        assert!(!drive.is_safe_target());
    }

    #[test]
    fn test_parse_block_device_unlabeled_usb() {
        let dir = TempDir::new().unwrap();
        fake_device(dir.path(), "sdb", 2048, "1", &[]);

        let drive = parse_block_device(dir.path(), "sdb", &HashMap::new(), &HashMap::new())
            .unwrap();
        assert!(drive.is_safe_target());
        assert_eq!(drive.volume_label(), None);
    }

    #[test]
    fn test_parse_block_device_internal_disk() {
        let dir = TempDir::new().unwrap();
        fake_device(dir.path(), "sda", 1 << 30, "0", &["sda1"]);
        let mounts = HashMap::from([("/dev/sda1".to_string(), "/".to_string())]);

        let drive = parse_block_device(dir.path(), "sda", &mounts, &HashMap::new()).unwrap();
        assert!(drive.is_system);
        assert!(!drive.is_safe_target());
    }

    #[test]
    fn test_parse_block_device_empty_reader() {
        let dir = TempDir::new().unwrap();
        fake_device(dir.path(), "sdc", 0, "1", &[]);
        assert!(parse_block_device(dir.path(), "sdc", &HashMap::new(), &HashMap::new()).is_none());
    }

    #[test]
    fn test_parse_block_device_missing() {
        let dir = TempDir::new().unwrap();
        assert!(parse_block_device(dir.path(), "sdz", &HashMap::new(), &HashMap::new()).is_none());
    }
}
