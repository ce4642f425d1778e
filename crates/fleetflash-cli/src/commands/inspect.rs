//! Inspect command - prints the configuration block of a built image

use anyhow::{Context, Result};
use console::style;
use fleetflash_core::{read_config_block, Mode};
use std::path::Path;

/// Execute the inspect command
pub fn execute(image: &Path, offset: u64) -> Result<()> {
    let block = read_config_block(image, offset).with_context(|| {
        format!(
            "No configuration block at offset {offset} in {}",
            image.display()
        )
    })?;

    let mode = match block.mode {
        Mode::Manager => style("manager").green().bold(),
        Mode::Node => style("node").cyan().bold(),
    };

    println!("{} {}", style("Image:").bold(), image.display());
    println!("{} {}\n", style("Role: ").bold(), mode);
    println!("{block}");
    Ok(())
}
