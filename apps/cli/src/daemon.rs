//! Daemon startup and the one-shot commands.
//!
//! Startup order matters: privileges are checked before the configuration is
//! touched, and directories exist before the first device is mounted.

use std::path::Path;

use autodisk_core::config::{self, Config, Loaded};
use autodisk_core::{Daemon, InotifyWatcher, Result, SystemHost, disk};
use tracing::info;

/// Loads the configuration, or reports that a default one was written.
fn load_config(path: &Path) -> Result<Option<Config>> {
    match Config::load_or_init(path)? {
        Loaded::Config(config) => Ok(Some(config)),
        Loaded::Created(path) => {
            eprintln!(
                "Configuration file {} not found, created. Edit it and start autodisk again.",
                path.display()
            );
            Ok(None)
        }
    }
}

/// Runs the automount daemon until the watch source fails.
pub fn run_daemon(config_path: &Path) -> Result<()> {
    config::ensure_root()?;

    let Some(config) = load_config(config_path)? else {
        return Ok(());
    };
    let mut settings = config.resolve()?;
    settings.prepare_directories()?;
    info!(
        "Starting autodisk v{}, managing {} device(s) below {}",
        env!("CARGO_PKG_VERSION"),
        settings.devices.len(),
        settings.mount_root.display()
    );

    let watcher = InotifyWatcher::new(&settings.device_dir)?;
    let mut daemon = Daemon::new(settings, SystemHost::new(), watcher);
    daemon.scan_present();

    for (id, device) in daemon.registry().devices() {
        info!(
            device = %id,
            name = %device.name,
            mounted = device.mounted_count(),
            "managing"
        );
    }
    info!("watching {}", daemon.settings().device_dir.display());

    daemon.run()
}

/// Prints the probe result for one device as JSON.
pub fn probe_device(config_path: &Path, device: &str) -> Result<()> {
    let device_dir = match load_config(config_path)? {
        Some(config) => config.device_dir,
        None => return Ok(()),
    };

    let probe = disk::probe(&SystemHost::new(), &device_dir, device)?;
    match serde_json::to_string_pretty(&probe) {
        Ok(json) => println!("{}", json),
        Err(e) => snafu::whatever!("failed to render probe result: {}", e),
    }
    Ok(())
}

/// Prints the effective configuration as TOML.
pub fn print_config(config_path: &Path) -> Result<()> {
    if let Some(config) = load_config(config_path)? {
        print!("{}", config.to_toml()?);
    }
    Ok(())
}
