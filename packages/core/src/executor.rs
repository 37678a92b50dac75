//! System collaborators behind a typed interface.
//!
//! The daemon never builds shell strings. Everything it needs from the host
//! (block topology, mount table, mount/umount, holder processes, the
//! speaker) goes through [`Host`], which [`SystemHost`] implements by running
//! the usual tools with structured arguments.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::disk::{self, BlockEntry};
use crate::error::{Error, IoResultExt, Result};

/// Kernel mount table consulted by [`SystemHost::is_mounted`].
pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Options passed to every mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Owner of the files on filesystems without POSIX ownership.
    pub uid: u32,
    /// Group of the files on filesystems without POSIX ownership.
    pub gid: u32,
}

impl MountOptions {
    /// Renders the `-o` argument for `mount`.
    ///
    /// Drives are mounted with `sync`: they are short-lived removable media,
    /// so every write must reach the device before it can be pulled.
    pub fn to_option_string(&self) -> String {
        format!("sync,uid={},gid={}", self.uid, self.gid)
    }
}

/// Audible signals emitted on unmount outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    /// A device was fully unmounted and can be removed.
    Success,
    /// A partition could not be unmounted.
    Failure,
}

/// Host operations needed by the daemon.
pub trait Host {
    /// Lists the block topology of the device at `device_path`.
    fn list_blocks(&self, device_path: &Path) -> Result<Vec<BlockEntry>>;

    /// Mounts `source` on `target`.
    fn mount(&self, source: &Path, target: &Path, options: &MountOptions) -> Result<()>;

    /// Returns true if `target` is currently a mount point.
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Unmounts `target`.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Returns the pids of processes named `process` holding files open below `target`.
    fn holders(&self, target: &Path, process: &str) -> Result<Vec<i32>>;

    /// Terminates `pid` with a signal that cannot be caught.
    fn kill(&self, pid: i32) -> Result<()>;

    /// Emits an audible signal. Failures are not reported.
    fn alert(&self, alert: Alert);
}

/// [`Host`] backed by lsblk, mount, umount, lsof and beep.
#[derive(Debug, Clone)]
pub struct SystemHost {
    mount_table: PathBuf,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            mount_table: PathBuf::from(MOUNT_TABLE),
        }
    }
}

impl SystemHost {
    /// Creates a host reading the kernel's mount table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for SystemHost {
    fn list_blocks(&self, device_path: &Path) -> Result<Vec<BlockEntry>> {
        let output = run_command(
            Command::new("lsblk")
                .args(["-J", "-i", "-o", "KNAME,MODEL,LABEL,PARTLABEL,SIZE"])
                .arg(device_path),
            "lsblk",
        )?;
        check_status(&output, "lsblk")?;

        disk::parse_lsblk(&String::from_utf8_lossy(&output.stdout))
    }

    fn mount(&self, source: &Path, target: &Path, options: &MountOptions) -> Result<()> {
        let output = run_command(
            Command::new("mount")
                .arg("-o")
                .arg(options.to_option_string())
                .arg(source)
                .arg(target),
            "mount",
        )?;

        if !output.status.success() {
            return Err(Error::Mount {
                source_path: source.to_path_buf(),
                target: target.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let table = fs::read_to_string(&self.mount_table).map_err(|e| Error::MountTable {
            path: self.mount_table.clone(),
            source: e,
        })?;

        // The table lists resolved paths.
        let target = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        Ok(mount_points(&table).any(|point| point == target))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let output = run_command(Command::new("umount").arg(target), "umount")?;

        if !output.status.success() {
            return Err(Error::Unmount {
                path: target.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    fn holders(&self, target: &Path, process: &str) -> Result<Vec<i32>> {
        let output = run_command(
            Command::new("lsof")
                .args(["-a", "-t", "-c", process])
                .arg(target),
            "lsof",
        )?;

        holder_pids(&output)
    }

    fn kill(&self, pid: i32) -> Result<()> {
        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(Error::Kill { pid, source }),
        }
    }

    fn alert(&self, alert: Alert) {
        let args: &[&str] = match alert {
            Alert::Success => &[],
            Alert::Failure => &["-f", "800", "-l", "750", "-r", "2", "-d", "750"],
        };

        if let Err(e) = run_command(Command::new("beep").args(args), "beep") {
            debug!("beep unavailable: {}", e);
        }
    }
}

/// Runs a prepared command, capturing its output.
fn run_command(command: &mut Command, name: &str) -> Result<Output> {
    command.output().command_context(name)
}

/// Turns a non-zero exit status into [`Error::CommandExit`].
fn check_status(output: &Output, name: &str) -> Result<()> {
    if !output.status.success() {
        return Err(Error::CommandExit {
            command: name.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Iterates the mount points listed in a `/proc/mounts` style table.
pub fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

/// Decodes the octal escapes (`\040` for space, ...) the kernel uses in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Pids printed by lsof.
///
/// lsof exits 1 both when nothing matched and when some files could not be
/// examined, so printed pids are used whatever the status. Only a failure
/// without output is an error.
fn holder_pids(output: &Output) -> Result<Vec<i32>> {
    let pids = parse_pids(&String::from_utf8_lossy(&output.stdout));
    if pids.is_empty() && output.status.code() != Some(1) {
        check_status(output, "lsof")?;
    }
    Ok(pids)
}

/// Parses whitespace separated pids, ignoring anything that is not a number.
fn parse_pids(text: &str) -> Vec<i32> {
    text.split_whitespace()
        .filter_map(|pid| pid.parse().ok())
        .collect()
}
