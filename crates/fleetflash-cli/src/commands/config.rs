//! Configuration file management command

use anyhow::{Context, Result};
use console::style;
use fleetflash_core::Settings;
use std::path::PathBuf;

/// Arguments for the config command
pub struct ConfigArgs {
    /// Initialize a new configuration file with defaults
    pub init: bool,
    /// Print the effective settings
    pub show: bool,
    /// Suppress output (for scripting)
    pub quiet: bool,
    /// Configuration file path (from --config or the default location)
    pub config_file: Option<PathBuf>,
}

/// Execute the config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    if args.init {
        return init_config(args.config_file, args.quiet);
    }

    if args.show {
        return show_config(args.config_file);
    }

    // Default: print where the settings file lives
    let path = args
        .config_file
        .context("Could not determine configuration directory")?;
    println!("{}", path.display());
    if !path.exists() && !args.quiet {
        eprintln!(
            "{}",
            style("(not found, using defaults; create it with 'fleetflash config --init')").dim()
        );
    }
    Ok(())
}

/// Initialize a new configuration file with default values
fn init_config(config_path: Option<PathBuf>, quiet: bool) -> Result<()> {
    let path = config_path.context("Could not determine configuration directory")?;

    if path.exists() {
        if !quiet {
            eprintln!(
                "{} Configuration file already exists at: {}",
                style("Warning:").yellow(),
                path.display()
            );
            eprintln!("Use a text editor to modify it, or delete it to re-initialize.");
        }
        return Ok(());
    }

    let saved_path = Settings::default()
        .save_to_path(Some(path))
        .context("Failed to save configuration file")?;

    if !quiet {
        println!(
            "{} Created configuration file at: {}",
            style("Success:").green(),
            saved_path.display()
        );
        println!();
        println!("{}", Settings::default_config_string());
    }

    Ok(())
}

/// Print the effective settings as JSON
fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let settings = Settings::load_from_path(config_path);
    let json = serde_json::to_string_pretty(&settings)
        .context("Failed to serialize settings to JSON")?;
    println!("{json}");
    Ok(())
}
