//! List command - displays removable cards

use anyhow::{Context, Result};
use console::style;
use fleetflash_core::NO_DEVICE_PLACEHOLDER;
use fleetflash_detect::Drive;

use crate::backend::to_block_device;

/// Execute the list command
pub fn execute(show_all: bool, json: bool, quiet: bool) -> Result<()> {
    let all_drives = fleetflash_detect::list_all_drives().context("Failed to list drives")?;
    let total = all_drives.len();

    let drives = if show_all {
        all_drives
    } else {
        fleetflash_detect::filter_targets(all_drives)
    };

    // JSON output is machine-readable, print it even when quiet
    if json {
        println!("{}", serde_json::to_string_pretty(&drives)?);
        return Ok(());
    }

    if quiet {
        return Ok(());
    }

    if drives.is_empty() {
        println!("{NO_DEVICE_PLACEHOLDER}");
        return Ok(());
    }

    for drive in &drives {
        print_drive(drive, show_all);
    }

    if !show_all && total > drives.len() {
        println!(
            "{}",
            style(format!(
                "Note: {} system/internal drive(s) hidden. Use --all to show.",
                total - drives.len()
            ))
            .dim()
        );
    }

    Ok(())
}

/// Print a single drive's information
fn print_drive(drive: &Drive, detailed: bool) {
    let status = if drive.is_safe_target() {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    };

    println!("{} {}", status, to_block_device(drive).display());

    if !detailed {
        return;
    }

    if let Some(model) = &drive.model {
        println!("    Model: {}", style(model).dim());
    }

    if let Some(reason) = &drive.system_reason {
        println!("    Reason: {}", style(reason).dim());
    }

    if !drive.mount_points.is_empty() {
        println!(
            "    Mounted: {}",
            style(drive.mount_points.join(", ")).dim()
        );
    }
}
