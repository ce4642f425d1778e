//! Fleetflash - build a fleet of node images from one base image and flash them
//!
//! # Usage
//!
//! ```bash
//! # Check a network plan
//! fleetflash validate --gw 192.168.0.1 --dns "1.1.1.1, 8.8.8.8" --manager 192.168.0.2 --nodes 3
//!
//! # Build one manager and three node images
//! fleetflash build downloaded/Skybian-0.1.0.img --gw 192.168.0.1 \
//!     --dns 1.1.1.1 --manager 192.168.0.2 --nodes 3 --verify-dir downloaded
//!
//! # Write one of them to a card
//! fleetflash list
//! fleetflash flash final/Skybian-node-1.img /dev/sdb
//! ```

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use console::style;
use fleetflash_core::{Config, Settings};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod backend;
mod commands;
mod progress;

/// Fleetflash - build and flash node images for a fleet of boards
#[derive(Parser)]
#[command(name = "fleetflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this settings file instead of the default location
    #[arg(long, global = true, env = "FLEETFLASH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Network plan shared by `validate` and `build`
#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    /// Gateway IPv4 address
    #[arg(long)]
    pub gw: String,

    /// DNS servers, separated by commas or spaces (at most 3)
    #[arg(long)]
    pub dns: String,

    /// Manager IPv4 address; nodes take the addresses after it
    #[arg(long)]
    pub manager: String,

    /// Number of node images besides the manager
    #[arg(long)]
    pub nodes: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a network plan and print the address of every role
    Validate {
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// Verify an image against a checksum
    Verify {
        /// Image file to check
        image: PathBuf,

        /// Checksum algorithm (sha256, sha1, md5)
        #[arg(short, long, requires = "expected", conflicts_with_all = ["record", "dir"])]
        algorithm: Option<String>,

        /// Expected hex digest
        #[arg(short, long, requires = "algorithm")]
        expected: Option<String>,

        /// Checksum file (`<hex> *<file>`), algorithm taken from its extension
        #[arg(long, conflicts_with = "dir")]
        record: Option<PathBuf>,

        /// Directory holding the checksum file (defaults to the image's directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Build one image per role from a base image
    #[command(disable_version_flag = true)]
    Build {
        /// Base OS image
        base: PathBuf,

        #[command(flatten)]
        network: NetworkArgs,

        /// Output directory (defaults to the configured build directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Verify the base image against the checksum file in this directory first
        #[arg(long, value_name = "DIR")]
        verify_dir: Option<PathBuf>,

        /// Version tag of the base image
        #[arg(long)]
        version: Option<String>,
    },

    /// Print the configuration block embedded in a built image
    Inspect {
        /// Built image
        image: PathBuf,

        /// Byte offset of the configuration block (defaults to the configured offset)
        #[arg(long)]
        offset: Option<u64>,
    },

    /// List removable cards
    List {
        /// Show all drives including system drives
        #[arg(short, long)]
        all: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Write a built image to a card
    Flash {
        /// Built image
        image: PathBuf,

        /// Target card (e.g., /dev/sdb, /dev/disk4, \\.\PhysicalDrive2)
        device: String,

        /// Skip confirmation prompt (use with caution!)
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Show or create the settings file
    Config {
        /// Write a settings file with default values
        #[arg(long, conflicts_with = "show")]
        init: bool,

        /// Print the effective settings
        #[arg(long)]
        show: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Copy standard input to a raw device (privileged stage of a flash)
    #[command(hide = true)]
    RawWrite {
        /// Physical device path
        device: String,
    },
}

fn main() {
    // Set up panic handler for nicer error messages
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{} {}", style("Error:").red().bold(), panic_info);
    }));

    if let Err(e) = run() {
        eprintln!("{} {}", style("Error:").red().bold(), e);

        // Show cause chain in verbose mode
        if std::env::var("RUST_BACKTRACE").is_ok() {
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  {} {}", style("Caused by:").yellow(), cause);
                source = cause.source();
            }
        }

        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "off"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let quiet = cli.quiet;
    let settings_path = cli.config.clone().or_else(Settings::config_path);

    match cli.command {
        Commands::Validate { network } => commands::validate::execute(&network, quiet),
        Commands::Verify {
            image,
            algorithm,
            expected,
            record,
            dir,
        } => {
            let config = load_config(settings_path);
            commands::verify::execute(commands::verify::VerifyArgs {
                image,
                algorithm,
                expected,
                record,
                dir,
                chunk_size: config.checksum_chunk_size,
                cancel_flag: install_cancel_handler(quiet)?,
                quiet,
            })
        }
        Commands::Build {
            base,
            network,
            output,
            verify_dir,
            version,
        } => commands::build::execute(commands::build::BuildArgs {
            base,
            network,
            output,
            verify_dir,
            version,
            config: load_config(settings_path),
            cancel_flag: install_cancel_handler(quiet)?,
            quiet,
        }),
        Commands::Inspect { image, offset } => {
            let offset = offset.unwrap_or_else(|| load_config(settings_path).config_offset);
            commands::inspect::execute(&image, offset)
        }
        Commands::List { all, json } => commands::list::execute(all, json, quiet),
        Commands::Flash { image, device, yes } => {
            commands::flash::execute(commands::flash::FlashArgs {
                image,
                device,
                skip_confirm: yes,
                config: load_config(settings_path),
                cancel_flag: install_cancel_handler(quiet)?,
                quiet,
            })
        }
        Commands::Config { init, show } => commands::config::execute(commands::config::ConfigArgs {
            init,
            show,
            quiet,
            config_file: settings_path,
        }),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
        Commands::RawWrite { device } => commands::raw_write::execute(&device),
    }
}

/// Runtime configuration from the settings file
fn load_config(path: Option<PathBuf>) -> Config {
    Config::from(&Settings::load_from_path(path))
}

/// Route Ctrl+C to a cancel flag; a second Ctrl+C exits at once
fn install_cancel_handler(quiet: bool) -> Result<Arc<AtomicBool>> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            // Second Ctrl+C, force exit
            if !quiet {
                eprintln!("\n{}", style("Forced exit").red().bold());
            }
            std::process::exit(130);
        }
        if !quiet {
            eprintln!(
                "\n{}",
                style("Cancelling... Press Ctrl+C again to force exit").yellow()
            );
        }
    })?;
    Ok(cancelled)
}
