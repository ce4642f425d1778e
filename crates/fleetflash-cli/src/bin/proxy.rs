//! fleetflash-proxy - streams an image to standard output
//!
//! ```bash
//! fleetflash-proxy Skybian-node-1.img progress.log | dd of=/dev/sdb bs=4M
//! ```
//!
//! Percentages are appended to the progress log as the image is copied.
//! A read or write failure is recorded there as `ERROR: <reason>` and the
//! process exits with status 1. Diagnostics go to standard error only.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Copy an image to stdout while logging progress
#[derive(Parser)]
#[command(name = "fleetflash-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Image file to read
    input: PathBuf,

    /// File that receives percentage lines
    progress_log: PathBuf,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    // Stdout is line-buffered; image bytes are not lines
    let mut out = BufWriter::with_capacity(
        fleetflash_core::DEFAULT_PROXY_CHUNK_SIZE,
        std::io::stdout().lock(),
    );
    let relayed = fleetflash_core::proxy::run(&cli.input, &cli.progress_log, &mut out)
        .with_context(|| format!("Failed to stream {}", cli.input.display()))?;
    out.flush()?;

    tracing::debug!("Streamed {} bytes from {:?}", relayed, cli.input);
    Ok(())
}
