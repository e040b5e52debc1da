//! snapdisk - snapshot an OS medium and dump it into an image file.
//!
//! The medium is never modified: all work happens on a copy-on-write
//! snapshot that is torn down on exit, Ctrl-C or SIGTERM.

mod commands;
mod preflight;
mod timing;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::{create::CreateOptions, show::ShowTarget};
use snapdisk::config::Config;

#[derive(Parser)]
#[command(name = "snapdisk")]
#[command(about = "Copy-on-write snapshots of OS media")]
#[command(
    after_help = "QUICK START:\n  snapdisk preflight               Check host tools\n  snapdisk create /dev/sdb -o out  Snapshot /dev/sdb and dump it"
)]
struct Cli {
    /// Log filter (e.g. info, snapdisk=debug). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot a medium and dump the snapshot into a raw image file
    ///
    /// Non-raw images (qcow2, vmdk, ...) are converted to raw. For `/' the
    /// output is a squashfs filesystem image of the host, not a
    /// partitioned disk.
    Create {
        /// Image file, block device, or `/' for the running host
        medium: PathBuf,

        /// Image file to write
        #[arg(short, long)]
        outfile: PathBuf,

        /// Directory for temporary files (default: TMPDIR, else /var/tmp or /tmp)
        #[arg(long)]
        tmpdir: Option<PathBuf>,

        /// Work on the medium itself instead of a snapshot
        #[arg(long)]
        no_snapshot: bool,

        /// Overwrite the output file if it exists
        #[arg(short, long)]
        force: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowCommand,
    },

    /// Run preflight checks (host tools, kernel interfaces, privileges)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum ShowCommand {
    /// Show current configuration
    Config,
    /// Show how a medium would be snapshotted
    Medium {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();

    match cli.command {
        Commands::Create {
            medium,
            outfile,
            tmpdir,
            no_snapshot,
            force,
        } => {
            if let Some(dir) = &tmpdir {
                if !dir.is_dir() {
                    bail!("Argument `{}' to --tmpdir must be a directory", dir.display());
                }
            }
            let opts = CreateOptions {
                medium,
                outfile,
                tmpdir,
                snapshot: !no_snapshot,
                force,
            };
            commands::cmd_create(&opts, &config)?;
        }

        Commands::Show { what } => {
            let target = match what {
                ShowCommand::Config => ShowTarget::Config,
                ShowCommand::Medium { path } => ShowTarget::Medium(path),
            };
            commands::cmd_show(target, &config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(strict)?;
        }
    }

    Ok(())
}
