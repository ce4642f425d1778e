//! Raw-write command - the privileged end of a flash pipeline
//!
//! Reads image bytes from standard input and writes them to a physical
//! device in sector-aligned blocks. Standard output is left untouched;
//! failures go to standard error, where the flashing engine collects them.

use anyhow::{Context, Result};
use fleetflash_platform::{open_device, raw_write, DEFAULT_SINK_CHUNK_SIZE};

/// Execute the raw-write command
pub fn execute(device: &str) -> Result<()> {
    let mut sink = open_device(device).with_context(|| format!("Failed to open {device}"))?;

    let stdin = std::io::stdin();
    let written = raw_write(stdin.lock(), &mut sink, DEFAULT_SINK_CHUNK_SIZE)
        .with_context(|| format!("Write to {device} failed"))?;
    sink.sync()
        .with_context(|| format!("Failed to flush {device}"))?;

    tracing::info!("Wrote {} bytes to {}", written, device);
    Ok(())
}
