//! Byte-counting pass-through relay
//!
//! The privileged raw-copy tools (`dd`, `authopen`, the raw-write sink) report
//! nothing while they run. The relay sits in front of them: it copies its
//! input to its output unchanged and appends a percentage line to a separate
//! progress log after each chunk.
//!
//! Progress log format, one entry per line:
//!
//! ```text
//! 0.0%
//! 0.1%
//! ...
//! 100.0%
//! ```
//!
//! A failure is logged as `ERROR: <reason>`.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Default relay chunk (512 * 100 bytes)
pub const DEFAULT_PROXY_CHUNK_SIZE: usize = 512 * 100;

/// Prefix of a failure line in the progress log
pub const ERROR_PREFIX: &str = "ERROR";

/// One parsed line of the progress log
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// Percentage relayed so far (0-100)
    Percent(f64),
    /// The relay failed
    Error(String),
}

/// Parse one progress log line
///
/// Accepts `12.3%`, `12%` and `ERROR...`; anything else yields `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
        let reason = rest.trim_start_matches(':').trim();
        return Some(ProgressLine::Error(reason.to_string()));
    }

    let (number, _) = line.split_once('%')?;
    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        .map(|p| ProgressLine::Percent(p.clamp(0.0, 100.0)))
}

/// Summarize a whole progress log: any error wins, otherwise the last percentage
pub fn latest_progress(content: &str) -> Option<ProgressLine> {
    let mut latest = None;
    for line in content.lines() {
        match parse_progress_line(line) {
            Some(error @ ProgressLine::Error(_)) => return Some(error),
            Some(percent) => latest = Some(percent),
            None => {}
        }
    }
    latest
}

/// Copy `input` to `output`, logging progress to `log`
///
/// A line is written only when the permille value increases, so the log is
/// non-decreasing. Returns the number of bytes relayed.
pub fn relay<R, W, L>(
    input: &mut R,
    output: &mut W,
    log: &mut L,
    total_bytes: u64,
    chunk_size: usize,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    L: Write + ?Sized,
{
    match relay_inner(input, output, log, total_bytes, chunk_size.max(1)) {
        Ok(n) => Ok(n),
        Err(e) => {
            // Best effort, the log may be the thing that failed
            let _ = writeln!(log, "{ERROR_PREFIX}: {e}");
            let _ = log.flush();
            Err(e)
        }
    }
}

fn relay_inner<R, W, L>(
    input: &mut R,
    output: &mut W,
    log: &mut L,
    total_bytes: u64,
    chunk_size: usize,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    L: Write + ?Sized,
{
    let mut buffer = vec![0u8; chunk_size];
    let mut relayed = 0u64;
    let mut last_permille = 0u64;

    write_percent(log, 0)?;

    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        };

        output.write_all(&buffer[..n])?;
        relayed += n as u64;

        let permille = if total_bytes == 0 {
            1000
        } else {
            (relayed.saturating_mul(1000) / total_bytes).min(1000)
        };
        if permille > last_permille {
            write_percent(log, permille)?;
            last_permille = permille;
        }
    }

    output.flush()?;
    if last_permille < 1000 && relayed >= total_bytes {
        write_percent(log, 1000)?;
    }

    tracing::debug!("Relayed {} of {} bytes", relayed, total_bytes);
    Ok(relayed)
}

#[allow(clippy::cast_precision_loss)]
fn write_percent<L: Write + ?Sized>(log: &mut L, permille: u64) -> Result<()> {
    writeln!(log, "{:.1}%", permille as f64 / 10.0)?;
    log.flush()?;
    Ok(())
}

/// Relay a file to `output`, writing progress to a log file at `log_path`
pub fn run<W: Write + ?Sized>(input_path: &Path, log_path: &Path, output: &mut W) -> Result<u64> {
    let mut log = File::create(log_path)?;

    let opened = File::open(input_path).and_then(|f| {
        let size = f.metadata()?.len();
        Ok((f, size))
    });
    let (mut input, total) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            let _ = writeln!(log, "{ERROR_PREFIX}: {e}");
            return Err(Error::Io(e));
        }
    };

    relay(&mut input, output, &mut log, total, DEFAULT_PROXY_CHUNK_SIZE)
}

// ============================================================================
// UNIT TESTS
// ============================================================================
