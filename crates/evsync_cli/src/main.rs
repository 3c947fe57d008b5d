//! evsync CLI
//!
//! Command-line tools for inspecting evsync streams and schedules.
//!
//! # Commands
//!
//! - `stream-id` - Print the key and job tags of a stream
//! - `intervals` - Print the repeat interval of each standby bucket
//! - `replay` - Run a JSON fixture of event pages through a sync engine

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// evsync command-line tools.
#[derive(Parser)]
#[command(name = "evsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the key and job tags of a stream
    StreamId {
        #[command(subcommand)]
        stream: commands::stream_id::StreamArgs,
    },

    /// Print the repeat interval of each standby bucket
    Intervals {
        /// Resolve as if the app were in the foreground
        #[arg(long)]
        foreground: bool,

        /// Ignore standby buckets and use the flat background interval
        #[arg(long)]
        flat: bool,
    },

    /// Run a JSON fixture of event pages through a sync engine
    Replay {
        /// Path to the fixture file
        fixture: PathBuf,

        /// Maximum pages fetched per run
        #[arg(long)]
        max_pages: Option<u32>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::StreamId { stream } => {
            commands::stream_id::run(&stream, &cli.format)?;
        }
        Commands::Intervals { foreground, flat } => {
            commands::intervals::run(foreground, flat, &cli.format)?;
        }
        Commands::Replay { fixture, max_pages } => {
            commands::replay::run(&fixture, max_pages, &cli.format)?;
        }
        Commands::Version => {
            println!("evsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    #[test]
    fn crate_manifests_point_at_existing_readmes() {
        let crates = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
        let mut checked = 0;
        for entry in std::fs::read_dir(&crates).unwrap() {
            let dir = entry.unwrap().path();
            let Ok(manifest) = std::fs::read_to_string(dir.join("Cargo.toml")) else {
                continue;
            };
            if manifest.contains("readme = \"README.md\"") {
                assert!(dir.join("README.md").is_file(), "{} has no README.md", dir.display());
                checked += 1;
            }
        }
        assert_eq!(checked, 5);
    }
}
