//! Inspect and drive a time-limited file cache from the command line.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod cli;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "A two-tier, time-limited file cache."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a ttl-fcache config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a cached file to stdout.
    Get {
        /// Name of the file inside the cache directory.
        name: String,
    },

    /// Store a value in the cache.
    Put {
        /// Name of the file inside the cache directory.
        name: String,
        /// The value to store. Read from stdin if omitted.
        value: Option<String>,
    },

    /// Delete every file in the cache directory.
    Clear,

    /// Run an interactive shell against one long-lived cache.
    Shell,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    debug!(config = ?config, command = ?args.command, "Running command...");
    match cli::spawn(config, args.command) {
        Ok(cli::Status::Found) => {}
        Ok(cli::Status::Absent) => std::process::exit(1),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
