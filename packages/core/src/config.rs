//! Daemon configuration.
//!
//! The configuration lives in a TOML file. A missing file is written out with
//! the defaults so the operator has something to edit; a missing key falls
//! back to its default with a warning; a key of the wrong type is fatal.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{self, Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::warn;

use crate::error::{
    AccountLookupSnafu, ChownSnafu, ConfigParseSnafu, ConfigSerializeSnafu, Error, IoResultExt,
    Result,
};
use crate::executor::MountOptions;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/autodisk/autodisk.toml";

/// Directory whose entries name drives by their physical bus path.
pub const DEFAULT_DEVICE_DIR: &str = "/dev/disk/by-path";

/// Name of the directory holding unmount files, below the mount root.
pub const UNMOUNT_DIR_NAME: &str = "_UNMOUNT";

/// Keys recognised in the configuration file.
const KEYS: &[&str] = &[
    "beep",
    "devices",
    "mount_path_root",
    "mount_path_owner",
    "mount_path_group",
    "mount_path_perms",
    "kill",
    "settle_delay_secs",
    "device_dir",
];

/// Configuration file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Beep when a device is unmounted or fails to unmount.
    pub beep: bool,
    /// Entries of the device directory to manage (e.g. `pci-0000:00:14.0-usb-0:1:1.0-scsi-0:0:0:0`).
    pub devices: Vec<String>,
    /// Root of the mount tree.
    pub mount_path_root: PathBuf,
    /// User owning mounted files.
    pub mount_path_owner: String,
    /// Group owning mounted files.
    pub mount_path_group: String,
    /// Permission bits of created mount directories.
    pub mount_path_perms: u32,
    /// Processes killed when they keep a mount point busy.
    pub kill: Vec<String>,
    /// Seconds to wait after a device appears before probing it.
    pub settle_delay_secs: u64,
    /// Directory watched for device insertion and removal.
    pub device_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            beep: true,
            devices: Vec::new(),
            mount_path_root: PathBuf::from("/share/external"),
            mount_path_owner: "root".to_string(),
            mount_path_group: "root".to_string(),
            mount_path_perms: 0o755,
            kill: vec!["smbd".to_string()],
            settle_delay_secs: 2,
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
        }
    }
}

/// Outcome of [`Config::load_or_init`].
#[derive(Debug)]
pub enum Loaded {
    /// The file existed and was parsed.
    Config(Config),
    /// The file did not exist and was created with the defaults.
    Created(PathBuf),
}

impl Config {
    /// Parses configuration text, warning about keys that fall back to defaults.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text).context(ConfigParseSnafu { path })?;
        for (key, value) in Self::missing_defaults(&table)? {
            warn!(
                "configuration file {} has no key {}, using default value {}",
                path.display(),
                key,
                value
            );
        }
        for key in table.keys().filter(|key| !KEYS.contains(&key.as_str())) {
            warn!("configuration file {} has unknown key {}", path.display(), key);
        }

        let config: Self = toml::from_str(text).context(ConfigParseSnafu { path })?;
        if config.mount_path_perms > 0o7777 {
            return Err(Error::InvalidPermissions {
                perms: config.mount_path_perms,
            });
        }
        Ok(config)
    }

    /// Default values of the known keys absent from `table`.
    fn missing_defaults(table: &toml::Table) -> Result<Vec<(&'static str, toml::Value)>> {
        let defaults = toml::Table::try_from(Self::default()).context(ConfigSerializeSnafu)?;
        Ok(KEYS
            .iter()
            .filter(|key| !table.contains_key(**key))
            .filter_map(|key| defaults.get(*key).map(|value| (*key, value.clone())))
            .collect())
    }

    /// Loads the file at `path`, creating it with the defaults if it is missing.
    pub fn load_or_init(path: &Path) -> Result<Loaded> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).config_write_context(parent)?;
            }
            fs::write(path, Self::default().to_toml()?).config_write_context(path)?;
            return Ok(Loaded::Created(path.to_path_buf()));
        }

        let text = fs::read_to_string(path).config_read_context(path)?;
        Self::parse(path, &text).map(Loaded::Config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context(ConfigSerializeSnafu)
    }

    /// Resolves user and group names into [`Settings`].
    pub fn resolve(&self) -> Result<Settings> {
        let uid = User::from_name(&self.mount_path_owner)
            .context(AccountLookupSnafu {
                name: self.mount_path_owner.clone(),
            })?
            .ok_or_else(|| Error::UnknownUser {
                name: self.mount_path_owner.clone(),
            })?
            .uid;
        let gid = Group::from_name(&self.mount_path_group)
            .context(AccountLookupSnafu {
                name: self.mount_path_group.clone(),
            })?
            .ok_or_else(|| Error::UnknownGroup {
                name: self.mount_path_group.clone(),
            })?
            .gid;

        Ok(Settings::new(self, uid.as_raw(), gid.as_raw()))
    }
}

/// Runtime settings derived from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Tracked device directory entries.
    pub devices: Vec<String>,
    /// Directory watched for device insertion and removal.
    pub device_dir: PathBuf,
    /// Root of the mount tree.
    pub mount_root: PathBuf,
    /// Directory holding the unmount files.
    pub unmount_dir: PathBuf,
    /// Owner of mounted files.
    pub uid: u32,
    /// Group of mounted files.
    pub gid: u32,
    /// Permission bits of mount directories.
    pub perms: u32,
    /// Processes to kill before unmounting.
    pub kill: Vec<String>,
    /// Whether to beep on unmount outcomes.
    pub beep: bool,
    /// Pause between device insertion and probing.
    pub settle_delay: Duration,
}

impl Settings {
    /// Builds settings from a configuration and resolved ids.
    pub fn new(config: &Config, uid: u32, gid: u32) -> Self {
        Self {
            devices: config.devices.clone(),
            device_dir: config.device_dir.clone(),
            mount_root: config.mount_path_root.clone(),
            unmount_dir: config.mount_path_root.join(UNMOUNT_DIR_NAME),
            uid,
            gid,
            perms: config.mount_path_perms,
            kill: config.kill.clone(),
            beep: config.beep,
            settle_delay: Duration::from_secs(config.settle_delay_secs),
        }
    }

    /// Returns true if the device directory entry `id` is managed.
    pub fn tracks(&self, id: &str) -> bool {
        self.devices.iter().any(|device| device == id)
    }

    /// Options used for every mount.
    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            uid: self.uid,
            gid: self.gid,
        }
    }

    /// Mount root of a device.
    pub fn device_root(&self, device_name: &str) -> PathBuf {
        self.mount_root.join(device_name)
    }

    /// Mount path of one partition.
    pub fn partition_path(&self, device_name: &str, partition_name: &str) -> PathBuf {
        self.device_root(device_name).join(partition_name)
    }

    /// Path of the unmount file guarding a device.
    pub fn sentinel_path(&self, device_name: &str) -> PathBuf {
        self.unmount_dir
            .join(format!("DELETE_THIS_FILE_TO_UNMOUNT_{}", device_name))
    }

    /// Creates the mount root and the unmount directory, handing the latter to
    /// the configured owner so unmount files can be deleted by them.
    ///
    /// The mount root is replaced by its canonical path: the mount table lists
    /// resolved paths, so a symlinked or relative root would never match.
    pub fn prepare_directories(&mut self) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.mount_root)
            .directory_context(&self.mount_root)?;
        self.mount_root = fs::canonicalize(&self.mount_root).directory_context(&self.mount_root)?;
        self.unmount_dir = self.mount_root.join(UNMOUNT_DIR_NAME);

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.unmount_dir)
            .directory_context(&self.unmount_dir)?;
        fs::set_permissions(&self.unmount_dir, fs::Permissions::from_mode(0o755))
            .directory_context(&self.unmount_dir)?;

        unistd::chown(
            &self.unmount_dir,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        )
        .context(ChownSnafu {
            path: self.unmount_dir.clone(),
        })
    }
}

/// Fails unless the process runs as root.
pub fn ensure_root() -> Result<()> {
    if !unistd::geteuid().is_root() {
        return Err(Error::NotRoot);
    }
    Ok(())
}
