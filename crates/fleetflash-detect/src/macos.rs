//! macOS drive detection implementation
//!
//! Uses `diskutil` plist output for device enumeration and information.

use super::{is_system_mount_point, DetectError, Drive, Partition, Result};
use std::collections::HashMap;
use std::process::Command;

/// List all drives on macOS
///
/// # Errors
///
/// Returns an error if `diskutil list` cannot be run.
pub fn list_drives() -> Result<Vec<Drive>> {
    let plist = diskutil(&["list", "-plist"])?;
    let disk_names = parse_disk_list(&plist);

    let mut drives = Vec::new();
    for disk_name in disk_names {
        match get_disk_info(&disk_name) {
            Ok(Some(drive)) => drives.push(drive),
            Ok(None) => {}
            Err(e) => tracing::debug!("Failed to get info for {}: {}", disk_name, e),
        }
    }

    Ok(drives)
}

/// Run diskutil and return stdout
fn diskutil(args: &[&str]) -> Result<String> {
    let output = Command::new("diskutil")
        .args(args)
        .output()
        .map_err(|e| DetectError::CommandFailed(format!("diskutil {} failed: {e}", args[0])))?;

    if !output.status.success() {
        return Err(DetectError::CommandFailed(format!(
            "diskutil {} failed: {}",
            args[0],
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Scalar value of a plist line (`<string>`, `<integer>`, `<true/>`, `<false/>`)
fn plist_value(line: &str) -> Option<String> {
    let tag = |open: &str, close: &str| {
        line.strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
            .map(unescape_xml)
    };

    tag("<string>", "</string>")
        .or_else(|| tag("<integer>", "</integer>"))
        .or_else(|| match line {
            "<true/>" => Some("true".to_string()),
            "<false/>" => Some("false".to_string()),
            _ => None,
        })
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Key name of a `<key>` line
fn plist_key(line: &str) -> Option<&str> {
    line.strip_prefix("<key>")?.strip_suffix("</key>")
}

/// Strings in the array that follows `<key>{key}</key>`
fn string_array(plist: &str, key: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut lines = plist.lines().map(str::trim);

    if !lines.any(|l| plist_key(l) == Some(key)) {
        return values;
    }

    for line in lines {
        match line {
            "<array>" => {}
            "</array>" | "<array/>" => break,
            _ => {
                if let Some(value) = plist_value(line) {
                    values.push(value);
                }
            }
        }
    }

    values
}

/// Whole disk identifiers from `diskutil list -plist`
///
/// Falls back to `AllDisks` minus slices. No disks is an empty list.
pub(crate) fn parse_disk_list(plist: &str) -> Vec<String> {
    let mut disks = string_array(plist, "WholeDisks");

    if disks.is_empty() {
        disks = string_array(plist, "AllDisks")
            .into_iter()
            .filter(|d| is_whole_disk(d))
            .collect();
    }

    disks.sort();
    disks.dedup();
    disks
}

/// `disk4` is whole, `disk4s1` is a slice
fn is_whole_disk(identifier: &str) -> bool {
    identifier
        .strip_prefix("disk")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Get detailed info for a specific disk
fn get_disk_info(disk_name: &str) -> Result<Option<Drive>> {
    let info = parse_disk_info(&diskutil(&["info", "-plist", disk_name])?);
    let partitions = diskutil(&["list", "-plist", disk_name])
        .map(|plist| parse_partitions(&plist, disk_name))
        .unwrap_or_default();

    Ok(drive_from_info(disk_name, &info, partitions))
}

/// Build a Drive from `diskutil info` keys and its partitions
pub(crate) fn drive_from_info(
    disk_name: &str,
    info: &HashMap<String, String>,
    partitions: Vec<Partition>,
) -> Option<Drive> {
    let flag = |key: &str| info.get(key).is_some_and(|v| v == "true");

    // Synthesized APFS containers and disk images
    if info.get("VirtualOrPhysical").map(String::as_str) == Some("Virtual") {
        return None;
    }

    let device_node = info.get("DeviceNode")?.clone();

    let size = info
        .get("TotalSize")
        .or_else(|| info.get("Size"))
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    if size == 0 {
        return None;
    }

    let removable = flag("RemovableMedia") || flag("Removable") || flag("Ejectable");
    let internal = info.get("Internal").is_none_or(|v| v == "true");

    let mount_points: Vec<String> = partitions
        .iter()
        .filter_map(|p| p.mount_point.clone())
        .collect();

    let (is_system, system_reason) =
        check_if_system_drive(info, &mount_points, internal, removable);

    Some(Drive {
        path: device_node,
        raw_path: format!("/dev/r{disk_name}"),
        label: info
            .get("VolumeName")
            .filter(|v| !v.is_empty())
            .cloned(),
        model: info.get("MediaName").cloned(),
        size,
        removable,
        is_system,
        system_reason,
        mount_points,
        partitions,
    })
}

/// Parse disk info plist into a key-value map
pub(crate) fn parse_disk_info(plist: &str) -> HashMap<String, String> {
    let mut info = HashMap::new();
    let mut current_key: Option<String> = None;

    for line in plist.lines().map(str::trim) {
        if let Some(key) = plist_key(line) {
            current_key = Some(key.to_string());
        } else if let Some(key) = current_key.take() {
            if let Some(value) = plist_value(line) {
                info.insert(key, value);
            }
        }
    }

    info
}

/// Parse partitions from `diskutil list -plist <disk>` output
pub(crate) fn parse_partitions(plist: &str, disk_name: &str) -> Vec<Partition> {
    let mut partitions = Vec::new();
    let mut in_partitions = false;
    let mut current: HashMap<String, String> = HashMap::new();
    let mut current_key: Option<String> = None;

    for line in plist.lines().map(str::trim) {
        if !in_partitions {
            in_partitions = matches!(
                plist_key(line),
                Some("AllDisksAndPartitions" | "Partitions")
            );
            continue;
        }

        match line {
            "<dict>" => current.clear(),
            "</dict>" => {
                if let Some(dev_id) = current.get("DeviceIdentifier") {
                    if dev_id != disk_name {
                        partitions.push(Partition {
                            path: format!("/dev/{dev_id}"),
                            label: current.get("VolumeName").cloned(),
                            size: current
                                .get("Size")
                                .and_then(|s| s.parse::<u64>().ok())
                                .unwrap_or(0),
                            mount_point: current.get("MountPoint").cloned(),
                        });
                    }
                }
                current.clear();
            }
            _ => {
                if let Some(key) = plist_key(line) {
                    current_key = Some(key.to_string());
                } else if let Some(key) = current_key.take() {
                    if let Some(value) = plist_value(line) {
                        current.insert(key, value);
                    }
                }
            }
        }
    }

    partitions
}

/// Check if this is a system drive
fn check_if_system_drive(
    info: &HashMap<String, String>,
    mount_points: &[String],
    internal: bool,
    removable: bool,
) -> (bool, Option<String>) {
    if info.get("SystemImage").is_some_and(|s| s == "true") {
        return (true, Some("System image volume".to_string()));
    }

    if info.contains_key("BooterDevicePathStr") {
        return (true, Some("Boot device".to_string()));
    }

    for mp in mount_points {
        if is_system_mount_point(mp) {
            return (true, Some(format!("Contains system mount point: {mp}")));
        }
    }

    if internal && !removable {
        return (true, Some("Internal non-removable drive".to_string()));
    }

    (false, None)
}

// ============================================================================
// UNIT TESTS
// ============================================================================
