//! Fuzz test for progress log parsing

#![no_main]

use fleetflash_core::proxy::{latest_progress, parse_progress_line, ProgressLine};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    for line in data.lines() {
        if let Some(ProgressLine::Percent(p)) = parse_progress_line(line) {
            assert!((0.0..=100.0).contains(&p));
        }
    }

    let has_error = data
        .lines()
        .any(|l| matches!(parse_progress_line(l), Some(ProgressLine::Error(_))));
    if has_error {
        assert!(matches!(latest_progress(data), Some(ProgressLine::Error(_))));
    }
});
