//! Build command - derives one image per role from a base image
//!
//! Steps:
//! - validate the network plan before touching any file
//! - optionally verify the base image against its published checksum
//! - build the manager image and every node image, showing the current image
//!   and the whole build on two bars

use anyhow::{bail, Context, Result};
use console::style;
use fleetflash_core::{format_size, BaseImage, BuildProgress, Config, NodeImage, Session, Task};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::SystemBackend;
use crate::commands::validate::{network_config, print_plan};
use crate::progress::{build_bars, checksum_bar, permille};
use crate::NetworkArgs;

const EVENT_WAIT: Duration = Duration::from_millis(100);

/// Arguments for the build command
pub struct BuildArgs {
    pub base: PathBuf,
    pub network: NetworkArgs,
    pub output: Option<PathBuf>,
    pub verify_dir: Option<PathBuf>,
    pub version: Option<String>,
    pub config: Config,
    pub cancel_flag: Arc<AtomicBool>,
    pub quiet: bool,
}

/// Execute the build command
pub fn execute(args: BuildArgs) -> Result<()> {
    let quiet = args.quiet;
    let network = network_config(&args.network)?;

    let mut base = BaseImage::open(&args.base, args.config.config_offset)?;
    if let Some(version) = &args.version {
        base = base.with_version(version.clone());
    }

    if !quiet {
        println!(
            "{} {} ({}{})",
            style("Base image:").bold(),
            style(base.path().display()).cyan(),
            format_size(base.size()),
            base.version().map(|v| format!(", version {v}")).unwrap_or_default()
        );
        print_plan(&network);
        println!();
    }

    let session = Session::new(args.config, Arc::new(SystemBackend::new()?))?;

    if let Some(dir) = &args.verify_dir {
        verify_base(&session, &base, dir, &args.cancel_flag, quiet)?;
    }

    let dest = args
        .output
        .unwrap_or_else(|| session.config().build_dir.clone());
    let task = session.spawn_build(base, network, Some(dest.as_path()))?;
    watch_build(&task, &args.cancel_flag, quiet);
    let images = task.join()?;

    if !quiet {
        println!(
            "{} Built {} image(s) in {}",
            style("✓").green().bold(),
            images.len(),
            style(dest.display()).cyan()
        );
        for image in &images {
            println!(
                "    {:<10} {}",
                style(image.role.nick()).cyan(),
                image.path.display()
            );
        }
    }

    Ok(())
}

/// Check the base image against the checksum file found in `dir`
fn verify_base(
    session: &Session,
    base: &BaseImage,
    dir: &Path,
    cancel_flag: &Arc<AtomicBool>,
    quiet: bool,
) -> Result<()> {
    let record = fleetflash_core::locate_checksum_record(dir)
        .with_context(|| format!("Cannot verify {}", base.path().display()))?;

    if !quiet {
        println!(
            "{} {} against {} ({})",
            style("Verifying").bold(),
            style(base.path().display()).cyan(),
            record.file_name,
            record.algorithm
        );
    }

    let task = session.spawn_verify(base.path().to_path_buf(), record)?;
    let pb = checksum_bar(base.size(), quiet);

    loop {
        if cancel_flag.load(Ordering::SeqCst) {
            task.cancel();
        }
        match task.events().recv_timeout(EVENT_WAIT) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            Ok(fraction) => pb.set_position((fraction * base.size() as f64) as u64),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    pb.finish_and_clear();

    if !task.join()? {
        bail!("Base image checksum does not match; download it again");
    }
    if !quiet {
        println!("  {} Checksum verified\n", style("✓").green());
    }
    Ok(())
}

/// Drain build events into the two bars until the worker finishes
fn watch_build(
    task: &Task<BuildProgress, Vec<NodeImage>>,
    cancel_flag: &Arc<AtomicBool>,
    quiet: bool,
) {
    let (_multi, image_bar, overall_bar) = build_bars(quiet);
    let mut current: Option<u32> = None;

    loop {
        if cancel_flag.load(Ordering::SeqCst) {
            task.cancel();
        }
        match task.events().recv_timeout(EVENT_WAIT) {
            Ok(progress) => {
                if current != Some(progress.role_index) {
                    current = Some(progress.role_index);
                    image_bar.reset();
                    image_bar.set_message(format!(
                        "{} ({}/{})",
                        progress.role.nick(),
                        progress.role_index + 1,
                        progress.total_roles
                    ));
                }
                image_bar.set_position(permille(progress.image_percent()));
                overall_bar.set_position(permille(progress.overall_percent()));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    image_bar.finish_and_clear();
    overall_bar.finish_and_clear();
}
