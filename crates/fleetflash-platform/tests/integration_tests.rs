//! Integration tests for fleetflash-platform
//!
//! These tests exercise the public API against regular files. Tests that
//! need real devices are marked with #[ignore].

use fleetflash_platform::*;
use std::io::{Cursor, Read};
use tempfile::NamedTempFile;

// ============================================================================
// Alignment tests
// ============================================================================

#[test]
fn test_align_up_sector_multiples() {
    for n in [1usize, 2, 7, 100] {
        let size = n * SECTOR_SIZE;
        assert_eq!(align_up(size - 1, SECTOR_SIZE), size);
        assert_eq!(align_up(size, SECTOR_SIZE), size);
        assert!(is_aligned(size, SECTOR_SIZE));
        assert!(!is_aligned(size + 1, SECTOR_SIZE));
    }
}

// ============================================================================
// Raw sink tests
// ============================================================================

#[test]
fn test_raw_write_into_file_pads_final_sector() {
    let image: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    let target = NamedTempFile::new().unwrap();

    let written = raw_write(
        Cursor::new(image.clone()),
        target.reopen().unwrap(),
        DEFAULT_SINK_CHUNK_SIZE,
    )
    .unwrap();
    assert_eq!(written, 10_240);

    let mut on_disk = Vec::new();
    target.reopen().unwrap().read_to_end(&mut on_disk).unwrap();
    assert_eq!(on_disk.len(), 10_240);
    assert_eq!(&on_disk[..image.len()], &image[..]);
    assert!(on_disk[image.len()..].iter().all(|&b| b == 0));
}

#[test]
fn test_raw_write_aligned_image_is_exact() {
    let image = vec![0x5Au8; 8 * SECTOR_SIZE];
    let mut out = Vec::new();
    assert_eq!(raw_write(Cursor::new(&image), &mut out, 3000).unwrap(), 4096);
    assert_eq!(out, image);
}

#[test]
fn test_raw_write_into_device_sink() {
    let target = NamedTempFile::new().unwrap();
    let sink = DeviceSink::new(target.reopen().unwrap());

    let written = raw_write(Cursor::new(vec![1u8; 700]), sink, 256).unwrap();
    assert_eq!(written, 1024);
    assert_eq!(target.as_file().metadata().unwrap().len(), 1024);
}

#[test]
fn test_raw_write_empty_input() {
    let mut out = Vec::new();
    assert_eq!(raw_write(Cursor::new(Vec::new()), &mut out, 512).unwrap(), 0);
    assert!(out.is_empty());
}

// ============================================================================
// Writer command tests
// ============================================================================

#[test]
fn test_writer_command_targets_device() {
    let cmd = writer_command("/dev/sdb", false, "/usr/bin/fleetflash");
    assert!(!cmd.program.is_empty());
    assert!(cmd.to_string().contains("sdb"));
}

#[cfg(target_os = "linux")]
#[test]
fn test_writer_command_linux_elevation() {
    assert_eq!(writer_command("/dev/sdb", false, "fleetflash").program, "pkexec");
    assert_eq!(writer_command("/dev/sdb", true, "fleetflash").program, "dd");
}

#[cfg(unix)]
#[test]
fn test_writer_command_pipes_stdin_to_file() {
    use std::io::Write;
    use std::process::Stdio;

    // The unprivileged form of the Linux command, minus pkexec
    let target = NamedTempFile::new().unwrap();
    let cmd = WriterCommand::new("dd")
        .arg(format!("of={}", target.path().display()))
        .arg("status=none");

    let mut child = cmd.command().stdin(Stdio::piped()).spawn().unwrap();
    child.stdin.take().unwrap().write_all(&[7u8; 4096]).unwrap();
    assert!(child.wait().unwrap().success());
    assert_eq!(std::fs::read(target.path()).unwrap(), vec![7u8; 4096]);
}

// ============================================================================
// Device tests
// ============================================================================

#[cfg(unix)]
#[test]
fn test_open_device_regular_file() {
    let target = NamedTempFile::new().unwrap();
    let mut sink = open_device(target.path().to_str().unwrap()).unwrap();
    std::io::Write::write_all(&mut sink, &[0u8; 512]).unwrap();
    sink.sync().unwrap();
}

#[test]
fn test_has_elevated_privileges_does_not_panic() {
    let _ = has_elevated_privileges();
}

#[test]
#[ignore = "requires a removable device, run with: cargo test -- --ignored"]
fn test_unmount_real_device() {
    if let Ok(device) = std::env::var("FLEETFLASH_TEST_DEVICE") {
        unmount_device(&device).unwrap();
        remount_device(&device).unwrap();
    }
}
