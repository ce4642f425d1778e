//! Windows drive detection implementation
//!
//! Uses PowerShell CIM queries (`Win32_DiskDrive` and the disk to partition
//! to logical disk associations) for device enumeration.

use super::{is_system_mount_point, DetectError, Drive, Partition, Result};
use std::collections::HashMap;
use std::process::Command;

/// `Win32_DiskDrive.Capabilities` code for removable media
const CAPABILITY_REMOVABLE: &str = "7";

const DISKS_QUERY: &str = r"Get-CimInstance -ClassName Win32_DiskDrive | Select-Object Index,DeviceID,Model,Size,MediaType,InterfaceType,@{n='Capabilities';e={$_.Capabilities -join ';'}} | ConvertTo-Csv -NoTypeInformation";

const VOLUMES_QUERY: &str = r"Get-CimInstance -ClassName Win32_DiskDrive | ForEach-Object { $d = $_; Get-CimAssociatedInstance -InputObject $d -ResultClassName Win32_DiskPartition | ForEach-Object { Get-CimAssociatedInstance -InputObject $_ -ResultClassName Win32_LogicalDisk | ForEach-Object { [pscustomobject]@{ DiskIndex = $d.Index; DriveLetter = $_.DeviceID; Label = $_.VolumeName; Size = $_.Size } } } } | ConvertTo-Csv -NoTypeInformation";

/// List all drives on Windows
///
/// # Errors
///
/// Returns an error if the disk query cannot be run.
pub fn list_drives() -> Result<Vec<Drive>> {
    let disks = parse_powershell_disks(&powershell(DISKS_QUERY)?);
    let volumes = powershell(VOLUMES_QUERY)
        .map(|csv| parse_powershell_volumes(&csv))
        .unwrap_or_default();

    Ok(disks
        .into_iter()
        .map(|disk| {
            let partitions: Vec<Partition> = volumes
                .iter()
                .filter(|v| v.disk_index == disk.index)
                .map(|v| Partition {
                    path: v.drive_letter.clone(),
                    label: v.label.clone(),
                    size: v.size,
                    mount_point: Some(v.drive_letter.clone()),
                })
                .collect();
            drive_from_disk(disk, partitions)
        })
        .collect())
}

/// Run a PowerShell command and return stdout
fn powershell(command: &str) -> Result<String> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", command])
        .output()
        .map_err(|e| DetectError::CommandFailed(format!("PowerShell failed: {e}")))?;

    if !output.status.success() {
        return Err(DetectError::CommandFailed(format!(
            "PowerShell failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Physical disk info from CIM
#[derive(Debug, Clone)]
pub(crate) struct PhysicalDisk {
    pub index: u32,
    pub device_id: String,
    pub model: String,
    pub size: u64,
    pub media_type: String,
    pub interface_type: String,
    pub capabilities: Vec<String>,
}

impl PhysicalDisk {
    /// Removable media capability or a removable/external media type
    pub(crate) fn is_removable(&self) -> bool {
        self.capabilities.iter().any(|c| c == CAPABILITY_REMOVABLE)
            || self.media_type.contains("Removable")
            || self.media_type.contains("External")
    }
}

/// Logical volume with the disk it lives on
#[derive(Debug, Clone)]
pub(crate) struct VolumeInfo {
    pub disk_index: u32,
    pub drive_letter: String,
    pub label: Option<String>,
    pub size: u64,
}

/// Build a Drive from a disk and its volumes
pub(crate) fn drive_from_disk(disk: PhysicalDisk, partitions: Vec<Partition>) -> Drive {
    let mount_points: Vec<String> = partitions
        .iter()
        .filter_map(|p| p.mount_point.clone())
        .collect();

    let removable = disk.is_removable();
    let (is_system, system_reason) =
        check_if_system_drive(&disk.media_type, &mount_points, &disk.interface_type);

    let path = if disk.device_id.is_empty() {
        format!("\\\\.\\PHYSICALDRIVE{}", disk.index)
    } else {
        disk.device_id
    };

    Drive {
        raw_path: path.clone(),
        path,
        label: None,
        model: Some(disk.model).filter(|m| !m.is_empty()),
        size: disk.size,
        removable,
        is_system,
        system_reason,
        mount_points,
        partitions,
    }
}

/// Rows of a `ConvertTo-Csv` table keyed by header
fn csv_rows(csv: &str) -> Vec<HashMap<String, String>> {
    let mut lines = csv.lines().map(str::trim).filter(|l| !l.is_empty());

    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let headers = parse_csv_line(header_line);

    lines
        .map(parse_csv_line)
        .filter(|fields| fields.len() == headers.len())
        .map(|fields| headers.iter().cloned().zip(fields).collect())
        .collect()
}

/// Parse PowerShell CSV output for disks
pub(crate) fn parse_powershell_disks(csv: &str) -> Vec<PhysicalDisk> {
    csv_rows(csv)
        .into_iter()
        .filter_map(|row| {
            let get = |key: &str| row.get(key).cloned().unwrap_or_default();
            let size = get("Size").parse::<u64>().unwrap_or(0);
            if size == 0 {
                // Card reader without a card
                return None;
            }

            Some(PhysicalDisk {
                index: get("Index").parse().unwrap_or(0),
                device_id: get("DeviceID"),
                model: get("Model"),
                size,
                media_type: get("MediaType"),
                interface_type: get("InterfaceType"),
                capabilities: get("Capabilities")
                    .split(';')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect(),
            })
        })
        .collect()
}

/// Parse PowerShell CSV output for volumes
pub(crate) fn parse_powershell_volumes(csv: &str) -> Vec<VolumeInfo> {
    csv_rows(csv)
        .into_iter()
        .filter_map(|row| {
            let drive_letter = row.get("DriveLetter").filter(|s| !s.is_empty())?.clone();
            Some(VolumeInfo {
                disk_index: row.get("DiskIndex")?.parse().ok()?,
                drive_letter,
                label: row.get("Label").filter(|s| !s.is_empty()).cloned(),
                size: row
                    .get("Size")
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0),
            })
        })
        .collect()
}

/// Parse a CSV line handling quoted fields
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Check if this is a system drive
pub(crate) fn check_if_system_drive(
    media_type: &str,
    mount_points: &[String],
    interface_type: &str,
) -> (bool, Option<String>) {
    for mp in mount_points {
        if is_system_mount_point(mp) {
            return (true, Some(format!("Contains Windows system drive: {mp}")));
        }
    }

    if media_type == "Fixed hard disk media" && !interface_type.eq_ignore_ascii_case("USB") {
        return (true, Some("Fixed internal hard disk".to_string()));
    }

    (false, None)
}

// ============================================================================
// UNIT TESTS
// ============================================================================
