//! The event loop.
//!
//! A single thread waits on the [`Watcher`] and handles one event at a time.
//! Every registry change made for an event is complete before the next wait,
//! which is what keeps device records and unmount files consistent without
//! any locking.
//!
//! Per device the lifecycle is:
//!
//! ```text
//! Unseen -> Probed -> Mounted -> AwaitingUnmount -> Unmounted (-> Unseen)
//!                                       ^                |
//!                                       +-- re-armed <---+ on failure
//! ```

use std::path::Path;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::disk::{self, Probe};
use crate::error::Result;
use crate::executor::Host;
use crate::mount;
use crate::registry::Registry;
use crate::trigger;
use crate::unmount;
use crate::watch::{Event, Watcher};

/// Owns the registry and drives mounts and unmounts from watch events.
pub struct Daemon<H, W> {
    settings: Settings,
    host: H,
    watcher: W,
    registry: Registry,
}

impl<H: Host, W: Watcher> Daemon<H, W> {
    /// Creates a daemon with an empty registry.
    pub fn new(settings: Settings, host: H, watcher: W) -> Self {
        Self {
            settings,
            host,
            watcher,
            registry: Registry::new(),
        }
    }

    /// Current registry contents.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Settings the daemon runs with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The host collaborator.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The watch source.
    pub fn watcher(&self) -> &W {
        &self.watcher
    }

    /// Mounts tracked devices that are already plugged in.
    pub fn scan_present(&mut self) {
        let present: Vec<String> = self
            .settings
            .devices
            .iter()
            .filter(|id| self.settings.device_dir.join(id).exists())
            .cloned()
            .collect();

        for id in present {
            self.load_device(&id);
        }
    }

    /// Waits for events and handles them until the watch source closes.
    pub fn run(&mut self) -> Result<()> {
        while let Some(events) = self.watcher.wait()? {
            for event in events {
                self.handle(event);
            }
        }
        Ok(())
    }

    /// Handles one event to completion.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::DeviceAdded(id) if self.settings.tracks(&id) => {
                info!(device = %id, "inserted");
                if !self.settings.settle_delay.is_zero() {
                    thread::sleep(self.settings.settle_delay);
                }
                self.load_device(&id);
            }
            Event::DeviceRemoved(id) if self.settings.tracks(&id) => {
                info!(device = %id, "removed");
                self.drop_device(&id);
            }
            Event::SentinelDeleted(path) => self.unmount_requested(&path),
            Event::DeviceAdded(id) | Event::DeviceRemoved(id) => {
                debug!(device = %id, "ignoring untracked device");
            }
        }
    }

    /// Probes, records and mounts a device, then arms its unmount file.
    fn load_device(&mut self, id: &str) {
        // A device seen again starts from scratch.
        if self.registry.device(id).is_some() {
            self.disarm_device(id);
            self.registry.remove_device(id);
        }

        let descriptor = match disk::probe(&self.host, &self.settings.device_dir, id) {
            Ok(Probe::Disk(descriptor)) => descriptor,
            Ok(Probe::Skip { kname }) => {
                info!(device = %id, "skipping device containing {}, not a simple disk", kname);
                return;
            }
            Err(e) => {
                warn!(device = %id, "probe failed: {}", e);
                return;
            }
        };

        let name = self.registry.record_device(id, descriptor).name.clone();
        let mounted = mount::mount_device(&self.host, &self.settings, &mut self.registry, id);
        if mounted == 0 {
            warn!(device = %id, "no partition of {} could be mounted", name);
            self.registry.remove_device(id);
            mount::remove_mount_point(&self.settings.device_root(&name));
            return;
        }

        self.arm(id);
        if let Some(device) = self.registry.device(id) {
            info!(device = %id, name = %device.name, mounted, "device ready");
        }
    }

    /// Arms the unmount file of a device, logging failures.
    fn arm(&mut self, id: &str) {
        if let Err(e) = trigger::arm(&self.settings, &mut self.registry, &mut self.watcher, id) {
            error!(device = %id, "could not create unmount file: {}", e);
        }
    }

    /// Disarms the unmount file of a device if one is armed.
    fn disarm_device(&mut self, id: &str) {
        let Some(path) = self.registry.sentinel_of(id).map(Path::to_path_buf) else {
            return;
        };
        if let Err(e) = trigger::disarm(&mut self.registry, &mut self.watcher, &path) {
            warn!(device = %id, "could not remove unmount file: {}", e);
            self.registry.remove_sentinel(&path);
        }
    }

    /// The device is physically gone: clean up as much as possible and forget it.
    fn drop_device(&mut self, id: &str) {
        if self.registry.sentinel_of(id).is_some() {
            self.disarm_device(id);
            if !unmount::unmount_device(&self.host, &self.settings, &mut self.registry, id) {
                warn!(device = %id, "device removed while still mounted, stale mount directories remain");
            }
        }
        self.registry.remove_device(id);
    }

    /// The operator deleted an unmount file.
    fn unmount_requested(&mut self, path: &Path) {
        let Some(id) = self.registry.lookup_device_by_sentinel(path).map(str::to_string) else {
            debug!("ignoring deletion of unknown file {}", path.display());
            return;
        };
        info!(device = %id, "deleted {}, unmounting related filesystems", path.display());

        if let Err(e) = trigger::disarm(&mut self.registry, &mut self.watcher, path) {
            warn!(device = %id, "could not disarm {}: {}", path.display(), e);
            self.registry.remove_sentinel(path);
        }

        if unmount::unmount_device(&self.host, &self.settings, &mut self.registry, &id) {
            info!(device = %id, "unmounted, safe to remove");
            self.registry.remove_device(&id);
        } else {
            warn!(device = %id, "unmount failed, re-creating {}", path.display());
            self.arm(&id);
        }
    }
}
