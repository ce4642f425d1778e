//! Integration tests for fleetflash-detect
//!
//! These tests exercise the public API. Tests that need real hardware are
//! ignored by default.

use fleetflash_detect::*;

fn card(path: &str, gib: u64) -> Drive {
    Drive::new(path).with_size(gib << 30).with_removable(true)
}

// ============================================================================
// Drive tests
// ============================================================================

#[test]
fn test_drive_builder_pattern() {
    let drive = card("/dev/sdb", 16)
        .with_label("SKYBIAN")
        .with_partition(Partition {
            path: "/dev/sdb1".to_string(),
            label: Some("BOOT".to_string()),
            size: 256 << 20,
            mount_point: Some("/media/user/BOOT".to_string()),
        });

    assert_eq!(drive.path, "/dev/sdb");
    assert_eq!(drive.raw_path, "/dev/sdb");
    assert_eq!(drive.volume_label(), Some("SKYBIAN"));
    assert_eq!(drive.mount_points, vec!["/media/user/BOOT".to_string()]);
    assert_eq!(drive.size_display(), "16.0 GB");
    assert!(drive.is_safe_target());
}

#[test]
fn test_drive_safety_combinations() {
    let cases = [
        (true, false, true),
        (true, true, false),
        (false, false, false),
        (false, true, false),
    ];

    for (removable, system, safe) in cases {
        let drive = Drive::new("/dev/sdx")
            .with_removable(removable)
            .with_system(system, None);
        assert_eq!(
            drive.is_safe_target(),
            safe,
            "removable={removable} system={system}"
        );
    }
}

// ============================================================================
// Target selection tests
// ============================================================================

#[test]
fn test_filter_targets_hides_system_and_fixed() {
    let drives = vec![
        Drive::new("/dev/sda")
            .with_size(512 << 30)
            .with_system(true, Some("Contains system mount point: /".to_string())),
        card("/dev/sdb", 8),
        card("/dev/mmcblk0", 32),
    ];

    let targets = filter_targets(drives);
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(Drive::is_safe_target));
    assert_eq!(targets[0].path, "/dev/mmcblk0");
}

#[test]
fn test_no_cards_is_empty_not_error() {
    let targets = filter_targets(vec![Drive::new("/dev/sda").with_size(1 << 40)]);
    assert!(targets.is_empty());
}

#[test]
fn test_check_target_errors() {
    let drives = vec![
        card("/dev/sdb", 8),
        Drive::new("/dev/sda").with_removable(false),
    ];

    assert!(check_target(drives.clone(), "/dev/sdb").is_ok());
    assert!(matches!(
        check_target(drives.clone(), "/dev/sdq"),
        Err(DetectError::NotFound(_))
    ));
    let err = check_target(drives, "/dev/sda").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Refusing to use /dev/sda: drive is not removable"
    );
}

// ============================================================================
// Formatting tests
// ============================================================================

#[test]
fn test_format_bytes_boundaries() {
    assert_eq!(format_bytes(1023), "1023 B");
    assert_eq!(format_bytes(1024), "1.0 KB");
    assert_eq!(format_bytes(1024 * 1024 - 1), "1024.0 KB");
    assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
    assert_eq!(format_bytes(1 << 30), "1.0 GB");
}

#[test]
fn test_system_mount_point_detection() {
    for mp in ["/", "/boot", "/boot/efi", "/usr/local", "/var/log", "C:\\"] {
        assert!(is_system_mount_point(mp), "{mp}");
    }
    for mp in ["/media/pi/rootfs", "/run/media/user/BOOT", "/Volumes/NO NAME", "F:"] {
        assert!(!is_system_mount_point(mp), "{mp}");
    }
}

// ============================================================================
// Real hardware tests
// ============================================================================

#[test]
#[ignore = "requires actual drives, run with: cargo test -- --ignored"]
fn test_list_drives_returns_result() {
    let result = list_drives();
    assert!(result.is_ok() || matches!(result, Err(DetectError::UnsupportedPlatform)));
}

#[test]
#[ignore = "requires actual drives, run with: cargo test -- --ignored"]
fn test_list_removable_drives_subset() {
    if let (Ok(all), Ok(removable)) = (list_all_drives(), list_removable_drives()) {
        assert!(removable.len() <= all.len());
        for r in &removable {
            assert!(r.is_safe_target());
            assert!(all.iter().any(|a| a.path == r.path));
        }
    }
}

#[test]
#[ignore = "requires actual drives, run with: cargo test -- --ignored"]
fn test_validate_target_rejects_system_drives() {
    if let Ok(drives) = list_all_drives() {
        for drive in drives.into_iter().filter(|d| d.is_system) {
            assert!(validate_target(&drive.path).is_err(), "{}", drive.path);
        }
    }
}
