//! Progress bar construction for the CLI
//!
//! Flash and build progress arrive as percentages, so those bars count
//! permille (0..=1000). Checksum progress is counted in bytes.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Bar length for percentage-driven bars
pub const PERMILLE: u64 = 1000;

const PROGRESS_CHARS: &str = "█▓░";

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(PROGRESS_CHARS)
}

/// Convert a percentage to a bar position
pub fn permille(percent: f64) -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let position = (percent.clamp(0.0, 100.0) * 10.0).round() as u64;
    position.min(PERMILLE)
}

/// Byte-counting bar for checksum verification
pub fn checksum_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    pb.set_style(bar_style(
        "  {spinner:.green} Checksumming [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
    ));
    pb
}

/// Flash bar; the message carries speed and ETA
pub fn flash_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(PERMILLE);
    pb.set_style(bar_style(
        "  {spinner:.green} Writing [{bar:40.cyan/blue}] {percent:>3}% {msg}",
    ));
    pb
}

/// Two-level build display: the image being built and the whole build
pub fn build_bars(quiet: bool) -> (MultiProgress, ProgressBar, ProgressBar) {
    let multi = MultiProgress::new();
    if quiet {
        return (multi, ProgressBar::hidden(), ProgressBar::hidden());
    }

    let image = multi.add(ProgressBar::new(PERMILLE));
    image.set_style(bar_style(
        "  {spinner:.green} {msg:<16} [{bar:40.cyan/blue}] {percent:>3}%",
    ));

    let overall = multi.add(ProgressBar::new(PERMILLE));
    overall.set_style(bar_style(
        "    {prefix:<16} [{bar:40.green/white}] {percent:>3}% ({elapsed})",
    ));
    overall.set_prefix("Overall");

    (multi, image, overall)
}
