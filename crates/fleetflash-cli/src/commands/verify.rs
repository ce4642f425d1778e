//! Verify command - checks an image against a published checksum
//!
//! The expected digest comes from, in order of precedence:
//! - `--algorithm` and `--expected` on the command line
//! - a checksum file given with `--record`
//! - the first checksum file in `--dir`, or in the image's own directory

use anyhow::{bail, Context, Result};
use console::style;
use fleetflash_core::{
    format_size, locate_checksum_record, ChecksumAlgorithm, ChecksumRecord, Error, Verifier,
    VerifyConfig,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::progress::checksum_bar;

/// Arguments for the verify command
pub struct VerifyArgs {
    pub image: PathBuf,
    pub algorithm: Option<String>,
    pub expected: Option<String>,
    pub record: Option<PathBuf>,
    pub dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub cancel_flag: Arc<AtomicBool>,
    pub quiet: bool,
}

/// Resolve the algorithm and digest to check against
fn expected_digest(args: &VerifyArgs) -> Result<(ChecksumAlgorithm, String)> {
    if let (Some(name), Some(hex)) = (&args.algorithm, &args.expected) {
        let algorithm: ChecksumAlgorithm = name.parse()?;
        return Ok((algorithm, hex.clone()));
    }

    let record = if let Some(path) = &args.record {
        ChecksumRecord::from_file(path)
            .with_context(|| format!("Failed to read checksum file {}", path.display()))?
    } else {
        let dir = args
            .dir
            .clone()
            .or_else(|| args.image.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        locate_checksum_record(&dir)?
    };

    let image_name = args
        .image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if record.file_name != image_name {
        tracing::warn!(
            "Checksum file names {}, verifying {} anyway",
            record.file_name,
            image_name
        );
    }

    Ok((record.algorithm, record.expected_hex))
}

/// Execute the verify command
pub fn execute(args: VerifyArgs) -> Result<()> {
    let (algorithm, expected) = expected_digest(&args)?;
    verify_image(
        &args.image,
        algorithm,
        &expected,
        args.chunk_size,
        args.cancel_flag,
        args.quiet,
    )
}

/// Stream `image` through `algorithm` with a progress bar and compare
pub fn verify_image(
    image: &Path,
    algorithm: ChecksumAlgorithm,
    expected: &str,
    chunk_size: usize,
    cancel_flag: Arc<AtomicBool>,
    quiet: bool,
) -> Result<()> {
    let size = std::fs::metadata(image)
        .with_context(|| format!("Failed to open image {}", image.display()))?
        .len();

    if !quiet {
        println!(
            "{} {} ({}, {})",
            style("Verifying").bold(),
            style(image.display()).cyan(),
            format_size(size),
            algorithm
        );
    }

    let pb = checksum_bar(size, quiet);
    let pb_clone = pb.clone();
    let mut verifier = Verifier::with_config(VerifyConfig::new().chunk_size(chunk_size))
        .with_cancel_flag(cancel_flag)
        .on_progress(move |p| pb_clone.set_position(p.bytes_processed));

    let result = verifier.verify_strict(image, algorithm, expected);
    pb.finish_and_clear();

    match result {
        Ok(()) => {
            if !quiet {
                println!("  {} Checksum verified ({})", style("✓").green(), algorithm);
            }
            Ok(())
        }
        Err(e @ Error::ChecksumMismatch { .. }) => {
            if !quiet {
                println!("  {} Checksum does not match", style("✗").red().bold());
            }
            bail!(e)
        }
        Err(e) => Err(e.into()),
    }
}
