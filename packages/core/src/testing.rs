//! In-memory collaborators for tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Config, Settings};
use crate::disk::BlockEntry;
use crate::error::{Error, Result};
use crate::executor::{Alert, Host, MountOptions};
use crate::watch::{Event, Watcher};

/// Settings rooted in a scratch directory, with no settle delay.
pub fn test_settings(dir: &Path) -> Settings {
    let config = Config {
        mount_path_root: dir.join("mnt"),
        device_dir: dir.join("by-path"),
        settle_delay_secs: 0,
        ..Config::default()
    };
    let settings = Settings::new(
        &config,
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    );
    fs::create_dir_all(&settings.unmount_dir).unwrap();
    settings
}

#[derive(Debug)]
struct Holder {
    process: String,
    pid: i32,
    dies_on_kill: bool,
}

#[derive(Debug, Default)]
struct HostState {
    blocks: HashMap<PathBuf, Vec<BlockEntry>>,
    mounts: HashMap<PathBuf, PathBuf>,
    failing: HashSet<String>,
    holders: HashMap<PathBuf, Vec<Holder>>,
    killed: Vec<i32>,
    alerts: Vec<Alert>,
}

/// [`Host`] with a scripted block topology and an in-memory mount table.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: RefCell<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_blocks(&self, device_path: &Path, entries: Vec<BlockEntry>) {
        self.state
            .borrow_mut()
            .blocks
            .insert(device_path.to_path_buf(), entries);
    }

    /// Makes mounting `/dev/<kname>` fail.
    pub fn fail_mount(&self, kname: &str) {
        self.state.borrow_mut().failing.insert(kname.to_string());
    }

    /// Keeps `target` busy with a process that survives a kill unless `dies_on_kill`.
    pub fn hold(&self, target: &Path, process: &str, pid: i32, dies_on_kill: bool) {
        self.state
            .borrow_mut()
            .holders
            .entry(target.to_path_buf())
            .or_default()
            .push(Holder {
                process: process.to_string(),
                pid,
                dies_on_kill,
            });
    }

    pub fn release(&self, target: &Path) {
        self.state.borrow_mut().holders.remove(target);
    }

    pub fn clear_mounts(&self) {
        self.state.borrow_mut().mounts.clear();
    }

    pub fn mounts_of(&self, target: &Path) -> Option<PathBuf> {
        self.state.borrow().mounts.get(target).cloned()
    }

    pub fn mount_count(&self) -> usize {
        self.state.borrow().mounts.len()
    }

    pub fn killed(&self) -> Vec<i32> {
        self.state.borrow().killed.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state.borrow().alerts.clone()
    }
}

impl Host for FakeHost {
    fn list_blocks(&self, device_path: &Path) -> Result<Vec<BlockEntry>> {
        self.state
            .borrow()
            .blocks
            .get(device_path)
            .cloned()
            .ok_or_else(|| Error::CommandExit {
                command: "lsblk".to_string(),
                code: 32,
                stderr: format!("{}: not a block device", device_path.display()),
            })
    }

    fn mount(&self, source: &Path, target: &Path, _options: &MountOptions) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let kname = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if state.failing.contains(&kname) {
            return Err(Error::Mount {
                source_path: source.to_path_buf(),
                target: target.to_path_buf(),
                message: "wrong fs type, bad option, bad superblock".to_string(),
            });
        }
        state
            .mounts
            .insert(target.to_path_buf(), source.to_path_buf());
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.state.borrow().mounts.contains_key(target))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.holders.get(target).is_some_and(|h| !h.is_empty()) {
            return Err(Error::Unmount {
                path: target.to_path_buf(),
                message: "target is busy".to_string(),
            });
        }
        match state.mounts.remove(target) {
            Some(_) => Ok(()),
            None => Err(Error::Unmount {
                path: target.to_path_buf(),
                message: "not mounted".to_string(),
            }),
        }
    }

    fn holders(&self, target: &Path, process: &str) -> Result<Vec<i32>> {
        Ok(self
            .state
            .borrow()
            .holders
            .get(target)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|h| h.process == process)
                    .map(|h| h.pid)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn kill(&self, pid: i32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.killed.push(pid);
        for holders in state.holders.values_mut() {
            holders.retain(|h| h.pid != pid || !h.dies_on_kill);
        }
        Ok(())
    }

    fn alert(&self, alert: Alert) {
        self.state.borrow_mut().alerts.push(alert);
    }
}

/// [`Watcher`] recording watches and replaying queued events.
#[derive(Debug, Default)]
pub struct FakeWatcher {
    watched: HashSet<PathBuf>,
    queue: VecDeque<Vec<Event>>,
    fail_adds: bool,
}

impl FakeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched.contains(path)
    }

    pub fn watch_count(&self) -> usize {
        self.watched.len()
    }

    /// Drops a watch the way the kernel does when the watched file is deleted.
    pub fn forget(&mut self, path: &Path) {
        self.watched.remove(path);
    }

    /// Makes every later [`Watcher::add`] fail.
    pub fn fail_adds(&mut self) {
        self.fail_adds = true;
    }

    pub fn push(&mut self, events: Vec<Event>) {
        self.queue.push_back(events);
    }
}

impl Watcher for FakeWatcher {
    fn add(&mut self, path: &Path) -> Result<()> {
        if self.fail_adds {
            return Err(Error::Watch {
                path: path.to_path_buf(),
                source: std::io::Error::from_raw_os_error(nix::errno::Errno::ENOSPC as i32),
            });
        }
        self.watched.insert(path.to_path_buf());
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.watched.remove(path);
        Ok(())
    }

    fn wait(&mut self) -> Result<Option<Vec<Event>>> {
        Ok(self.queue.pop_front())
    }
}
