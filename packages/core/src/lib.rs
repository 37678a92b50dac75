//! autodisk-core: Core library for the autodisk removable drive daemon.
//!
//! The daemon watches a device directory (normally `/dev/disk/by-path`) for
//! configured drives, mounts their partitions below a mount root and creates
//! an "unmount file" per drive. Deleting that file unmounts the drive.
//!
//! # Modules
//!
//! - [`disk`]: Disk probing with `lsblk` and name sanitizing
//! - [`registry`]: In-memory model of managed devices and unmount files
//! - [`mount`]: Mount directory creation and partition mounting
//! - [`trigger`]: Unmount file creation and removal
//! - [`unmount`]: Unmounting a device, killing processes that hold it
//! - [`watch`]: Inotify watches producing daemon events
//! - [`daemon`]: The event loop tying everything together
//! - [`executor`]: Host tools behind the [`executor::Host`] trait
//! - [`config`]: Configuration file and runtime settings
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use autodisk_core::{Config, Daemon, InotifyWatcher, Loaded, SystemHost};
//!
//! let Loaded::Config(config) = Config::load_or_init(Path::new("/etc/autodisk/autodisk.toml")).unwrap() else {
//!     return;
//! };
//! let mut settings = config.resolve().unwrap();
//! settings.prepare_directories().unwrap();
//!
//! let watcher = InotifyWatcher::new(&settings.device_dir).unwrap();
//! let mut daemon = Daemon::new(settings, SystemHost::new(), watcher);
//! daemon.scan_present();
//! daemon.run().unwrap();
//! ```

pub mod config;
pub mod daemon;
pub mod disk;
pub mod error;
pub mod executor;
pub mod mount;
pub mod registry;
pub mod trigger;
pub mod unmount;
pub mod watch;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, Loaded, Settings};
pub use daemon::Daemon;
pub use disk::{DeviceDescriptor, Probe};
pub use error::{Error, Result};
pub use executor::{Host, SystemHost};
pub use registry::Registry;
pub use watch::{Event, InotifyWatcher, Watcher};
