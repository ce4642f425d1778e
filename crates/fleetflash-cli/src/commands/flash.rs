//! Flash command - writes a built image to a card
//!
//! This command handles:
//! - Recognizing the image's role from its configuration block
//! - Target card validation and safety checks
//! - User confirmation
//! - Running the write pipeline with progress display

use anyhow::{bail, Context, Result};
use console::style;
use dialoguer::Confirm;
use fleetflash_core::{
    check_capacity, format_duration, format_size, format_speed, read_config_block, BlockDevice,
    Config, ConfigBlock, FlashProgress, FlashResult, Mode, NodeImage, Role, Session, Task,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{to_block_device, SystemBackend};
use crate::progress::{flash_bar, permille};

/// Arguments for the flash command
pub struct FlashArgs {
    pub image: PathBuf,
    pub device: String,
    pub skip_confirm: bool,
    pub config: Config,
    pub cancel_flag: Arc<AtomicBool>,
    pub quiet: bool,
}

/// Role of a built image, recovered from its configuration block
///
/// A node sits above the manager; any other address means the block was
/// not written by a build.
pub fn role_of(block: &ConfigBlock) -> Result<Role> {
    match block.mode {
        Mode::Manager => Ok(Role::Manager),
        Mode::Node => {
            let [.., ip] = block.ip.octets();
            let [.., manager] = block.manager.octets();
            match ip.checked_sub(manager) {
                Some(index) if index > 0 => Ok(Role::Node(u32::from(index))),
                _ => bail!(
                    "not a built node image: node IP {} is not above manager IP {}",
                    block.ip,
                    block.manager
                ),
            }
        }
    }
}

/// Describe a built image on disk
fn open_image(path: &Path, config_offset: u64) -> Result<NodeImage> {
    let block = read_config_block(path, config_offset)
        .with_context(|| format!("{} is not a built image", path.display()))?;
    let role = role_of(&block).with_context(|| format!("Cannot flash {}", path.display()))?;
    Ok(NodeImage::from_path(path, role)?)
}

/// Execute the flash command
pub fn execute(args: FlashArgs) -> Result<()> {
    let quiet = args.quiet;

    if cfg!(windows) && !fleetflash_platform::has_elevated_privileges() {
        bail!(
            "Administrator privileges required.\n\
             Right-click and select 'Run as administrator'."
        );
    }

    let image = open_image(&args.image, args.config.config_offset)?;
    if !quiet {
        println!(
            "{} {} ({}, {})",
            style("Image:").bold(),
            style(image.path.display()).cyan(),
            image.role,
            format_size(image.size)
        );
    }

    let drive = fleetflash_detect::validate_target(&args.device)
        .with_context(|| format!("Cannot write to {}", args.device))?;
    let device = to_block_device(&drive);
    check_capacity(image.size, device.size)?;

    if !quiet {
        println!("{} {}", style("Card: ").bold(), device.display());
        if !drive.mount_points.is_empty() {
            println!(
                "  {} Will unmount: {}",
                style("⚠").yellow(),
                drive.mount_points.join(", ")
            );
        }
    }

    if !args.skip_confirm && !confirm(&image, &device)? {
        println!("{}", style("Aborted.").yellow());
        return Ok(());
    }

    let session = Session::new(args.config, Arc::new(SystemBackend::new()?))?;
    let task = session.spawn_flash(image, device)?;
    watch_flash(&task, &args.cancel_flag, quiet);

    match task.join() {
        Ok(result) => {
            if !quiet {
                print_summary(&result);
            }
            Ok(())
        }
        Err(e) if e.device_corrupted() => {
            eprintln!(
                "{} The card was partially written and will not boot until it is flashed again.",
                style("Warning:").yellow().bold()
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn confirm(image: &NodeImage, device: &BlockDevice) -> Result<bool> {
    println!();
    println!(
        "{}",
        style("ALL DATA ON THE CARD WILL BE PERMANENTLY LOST!")
            .red()
            .bold()
    );
    println!();

    Ok(Confirm::new()
        .with_prompt(format!("Write {} to {}?", image.file_name(), device.id))
        .default(false)
        .interact()?)
}

/// Feed progress events to the bar until the worker finishes
fn watch_flash(task: &Task<FlashProgress, FlashResult>, cancel_flag: &Arc<AtomicBool>, quiet: bool) {
    let pb = flash_bar(quiet);

    loop {
        if cancel_flag.load(Ordering::SeqCst) {
            task.cancel();
        }
        match task.events().recv_timeout(Duration::from_millis(100)) {
            Ok(progress) => {
                pb.set_position(permille(progress.percent));
                pb.set_message(format!(
                    "{}, {} left",
                    progress.speed_display(),
                    progress.eta_display()
                ));
            }
            Err(RecvTimeoutError::Timeout) => pb.tick(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    pb.finish_and_clear();
}

fn print_summary(result: &FlashResult) {
    println!(
        "{} Wrote {} to {} in {} ({})",
        style("✓").green().bold(),
        format_size(result.bytes_written),
        result.device,
        format_duration(result.elapsed.as_secs()),
        format_speed(result.average_speed())
    );
    println!("  The card can be removed safely.");
}
