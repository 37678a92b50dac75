//! Unified error types for the autodisk-core library.
//!
//! The same `std::io::Error` shows up while creating mount points, unmount
//! files and watches, so each gets its own variant carrying the path involved.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount operation failed.
    #[snafu(display("failed to mount {} on {}: {message}", source_path.display(), target.display()))]
    Mount {
        source_path: PathBuf,
        target: PathBuf,
        message: String,
    },

    /// Unmount operation failed.
    #[snafu(display("failed to unmount {}: {message}", path.display()))]
    Unmount { path: PathBuf, message: String },

    /// Failed to read the mount table.
    #[snafu(display("failed to read mount table at {}", path.display()))]
    MountTable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Sending a signal to a holder process failed.
    #[snafu(display("failed to kill process {pid}"))]
    Kill { pid: i32, source: nix::errno::Errno },

    /// Failed to set up the inotify instance.
    #[snafu(display("failed to initialise inotify"))]
    WatchInit { source: std::io::Error },

    /// Failed to register or read a filesystem watch.
    #[snafu(display("failed to watch {}", path.display()))]
    Watch {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to create or remove a sentinel file.
    #[snafu(display("failed to manage unmount file {}", path.display()))]
    Sentinel {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to create a managed directory.
    #[snafu(display("failed to prepare directory {}", path.display()))]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to change ownership of a managed directory.
    #[snafu(display("failed to change owner of {}", path.display()))]
    Chown {
        path: PathBuf,
        source: nix::errno::Errno,
    },

    /// Configuration file cannot be read.
    #[snafu(display("failed to read configuration at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write configuration file.
    #[snafu(display("failed to write configuration at {}", path.display()))]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML or has wrongly typed keys.
    #[snafu(display("invalid configuration at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Configuration could not be rendered as TOML.
    #[snafu(display("failed to serialize configuration"))]
    ConfigSerialize { source: toml::ser::Error },

    /// Permission bits outside of `0o7777`.
    #[snafu(display("invalid mount_path_perms {perms:#o}"))]
    InvalidPermissions { perms: u32 },

    /// Configured owner does not exist.
    #[snafu(display("unknown user '{name}'"))]
    UnknownUser { name: String },

    /// Configured group does not exist.
    #[snafu(display("unknown group '{name}'"))]
    UnknownGroup { name: String },

    /// Looking up a user or group in the system database failed.
    #[snafu(display("failed to look up '{name}'"))]
    AccountLookup {
        name: String,
        source: nix::errno::Errno,
    },

    /// Daemon is not running as root.
    #[snafu(display(
        "you need to have root privileges to run autodisk, please try again using 'sudo'"
    ))]
    NotRoot,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for sentinel file errors.
    fn sentinel_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for watch registration errors.
    fn watch_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for managed directory errors.
    fn directory_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for configuration read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for configuration write errors.
    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn sentinel_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(SentinelSnafu { path: path.into() })
    }

    fn watch_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(WatchSnafu { path: path.into() })
    }

    fn directory_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(DirectorySnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigWriteSnafu { path: path.into() })
    }
}
