//! autodisk - automount removable drives on headless machines.
//!
//! Drives listed in the configuration are mounted as soon as they appear in
//! `/dev/disk/by-path`. Deleting the matching file in `<mount root>/_UNMOUNT`
//! unmounts them again.

mod daemon;

use std::path::PathBuf;
use std::process::ExitCode;

use autodisk_core::config::DEFAULT_CONFIG_PATH;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

/// autodisk command line.
#[derive(Parser)]
#[command(name = "autodisk")]
#[command(about = "Automount removable drives, unmount them by deleting a file", long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log debug messages.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for configured drives and mount them (the default).
    Run,

    /// Show how a device would be named and mounted, without mounting it.
    Probe {
        /// Entry of the device directory, e.g. pci-0000:00:14.0-usb-0:1:1.0-scsi-0:0:0:0
        device: String,
    },

    /// Print the effective configuration.
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "autodisk=debug,autodisk_core=debug,warn"
    } else {
        "autodisk=info,autodisk_core=info,warn"
    };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => daemon::run_daemon(&cli.config),
        Commands::Probe { device } => daemon::probe_device(&cli.config, &device),
        Commands::Config => daemon::print_config(&cli.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}
