//! Filesystem watches driving the daemon.
//!
//! One inotify instance watches the device directory for drives coming and
//! going, plus every armed unmount file for its deletion.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use snafu::ResultExt;
use tracing::debug;

use crate::error::{IoResultExt, Result, WatchInitSnafu};

/// Something happened that the daemon must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An entry appeared in the device directory.
    DeviceAdded(String),
    /// An entry disappeared from the device directory.
    DeviceRemoved(String),
    /// An unmount file was deleted.
    SentinelDeleted(PathBuf),
}

/// Source of [`Event`]s and registry of unmount file watches.
pub trait Watcher {
    /// Starts watching the unmount file at `path` for deletion.
    fn add(&mut self, path: &Path) -> Result<()>;

    /// Stops watching `path`. Not watching it is not an error.
    fn remove(&mut self, path: &Path) -> Result<()>;

    /// Blocks until events are available. `None` means no more events will come.
    fn wait(&mut self) -> Result<Option<Vec<Event>>>;
}

/// [`Watcher`] backed by inotify.
pub struct InotifyWatcher {
    inotify: Inotify,
    device_dir: PathBuf,
    device_wd: WatchDescriptor,
    sentinels: HashMap<WatchDescriptor, PathBuf>,
    buffer: Vec<u8>,
}

impl InotifyWatcher {
    /// Creates the inotify instance and starts watching `device_dir`.
    pub fn new(device_dir: &Path) -> Result<Self> {
        let inotify = Inotify::init().context(WatchInitSnafu)?;
        let device_wd = inotify
            .watches()
            .add(
                device_dir,
                WatchMask::CREATE | WatchMask::MOVED_TO | WatchMask::DELETE,
            )
            .watch_context(device_dir)?;

        Ok(Self {
            inotify,
            device_dir: device_dir.to_path_buf(),
            device_wd,
            sentinels: HashMap::new(),
            buffer: vec![0; 4096],
        })
    }

    fn descriptor_of(&self, path: &Path) -> Option<WatchDescriptor> {
        self.sentinels
            .iter()
            .find(|(_, watched)| watched.as_path() == path)
            .map(|(wd, _)| wd.clone())
    }
}

impl Watcher for InotifyWatcher {
    fn add(&mut self, path: &Path) -> Result<()> {
        // A watch left over from a previous arm of the same path is dropped first.
        self.remove(path)?;

        let wd = self
            .inotify
            .watches()
            .add(path, WatchMask::DELETE_SELF | WatchMask::DELETE)
            .watch_context(path)?;
        self.sentinels.insert(wd, path.to_path_buf());
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        let Some(wd) = self.descriptor_of(path) else {
            return Ok(());
        };
        self.sentinels.remove(&wd);

        match self.inotify.watches().remove(wd) {
            Ok(()) => Ok(()),
            // EINVAL: the kernel already dropped the watch with the file.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                debug!("watch for {} was already gone", path.display());
                Ok(())
            }
            Err(e) => Err(e).watch_context(path),
        }
    }

    fn wait(&mut self) -> Result<Option<Vec<Event>>> {
        let raw = self
            .inotify
            .read_events_blocking(&mut self.buffer)
            .watch_context(&self.device_dir)?;

        let mut events = Vec::new();
        for event in raw {
            if event.wd == self.device_wd {
                let Some(name) = event.name.and_then(|n| n.to_str()) else {
                    continue;
                };
                if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
                    events.push(Event::DeviceAdded(name.to_string()));
                } else if event.mask.contains(EventMask::DELETE) {
                    events.push(Event::DeviceRemoved(name.to_string()));
                }
            } else if event.mask.contains(EventMask::IGNORED) {
                self.sentinels.remove(&event.wd);
            } else if event
                .mask
                .intersects(EventMask::DELETE_SELF | EventMask::DELETE)
            {
                if let Some(path) = self.sentinels.get(&event.wd) {
                    events.push(Event::SentinelDeleted(path.clone()));
                }
            }
        }

        Ok(Some(events))
    }
}
