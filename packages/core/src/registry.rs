//! In-memory model of managed devices.
//!
//! Devices are keyed by their device directory entry, never by their display
//! name: two identical sticks produce the same name but live at different bus
//! paths. Unmount files are mapped back to the device they guard.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::disk::DeviceDescriptor;

/// A partition tracked for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Kernel name, mounted from `/dev/<kname>`.
    pub kname: String,
    /// Mount directory name.
    pub name: String,
    /// Whether the partition is currently mounted by us.
    pub mounted: bool,
}

/// A tracked device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Display name, unique among tracked devices.
    pub name: String,
    /// Partitions keyed by partition number.
    pub partitions: BTreeMap<u32, Partition>,
}

impl Device {
    /// Number of partitions currently mounted.
    pub fn mounted_count(&self) -> usize {
        self.partitions.values().filter(|p| p.mounted).count()
    }
}

/// Devices and unmount files known to the daemon.
#[derive(Debug, Default)]
pub struct Registry {
    devices: BTreeMap<String, Device>,
    sentinels: HashMap<PathBuf, String>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly probed device, replacing any previous record.
    ///
    /// If another tracked device already uses the derived name, a numeric
    /// suffix is appended so mount trees and unmount files stay distinct.
    pub fn record_device(&mut self, id: &str, descriptor: DeviceDescriptor) -> &Device {
        self.devices.remove(id);
        let name = self.unique_name(&descriptor.name);
        let partitions = descriptor
            .partitions
            .into_iter()
            .map(|(number, info)| {
                (
                    number,
                    Partition {
                        kname: info.kname,
                        name: info.name,
                        mounted: false,
                    },
                )
            })
            .collect();

        self.devices
            .insert(id.to_string(), Device { name, partitions });
        &self.devices[id]
    }

    fn unique_name(&self, base: &str) -> String {
        let taken = |candidate: &str| self.devices.values().any(|d| d.name == candidate);
        if !taken(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !taken(candidate.as_str()))
            .unwrap_or_else(|| base.to_string())
    }

    /// Maps an unmount file to the device it guards.
    pub fn record_sentinel(&mut self, path: impl Into<PathBuf>, id: &str) {
        self.sentinels.insert(path.into(), id.to_string());
    }

    /// Returns the device guarded by the unmount file at `path`.
    pub fn lookup_device_by_sentinel(&self, path: &Path) -> Option<&str> {
        self.sentinels.get(path).map(String::as_str)
    }

    /// Returns the unmount file guarding device `id`.
    pub fn sentinel_of(&self, id: &str) -> Option<&Path> {
        self.sentinels
            .iter()
            .find(|(_, device)| *device == id)
            .map(|(path, _)| path.as_path())
    }

    /// Forgets device `id` and any unmount file still mapped to it.
    pub fn remove_device(&mut self, id: &str) -> Option<Device> {
        self.sentinels.retain(|_, device| *device != id);
        self.devices.remove(id)
    }

    /// Forgets the unmount file at `path`.
    pub fn remove_sentinel(&mut self, path: &Path) -> Option<String> {
        self.sentinels.remove(path)
    }

    /// Returns device `id`.
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Returns the partitions of device `id`.
    pub fn all_partitions_of<'a>(
        &'a self,
        id: &str,
    ) -> impl Iterator<Item = (u32, &'a Partition)> + use<'a> {
        self.devices
            .get(id)
            .into_iter()
            .flat_map(|device| device.partitions.iter().map(|(n, p)| (*n, p)))
    }

    /// Sets the mounted flag of one partition.
    pub fn set_mounted(&mut self, id: &str, number: u32, mounted: bool) {
        if let Some(partition) = self
            .devices
            .get_mut(id)
            .and_then(|device| device.partitions.get_mut(&number))
        {
            partition.mounted = mounted;
        }
    }

    /// Iterates tracked devices.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &Device)> {
        self.devices.iter().map(|(id, device)| (id.as_str(), device))
    }

    /// Number of unmount files currently recorded.
    pub fn sentinel_count(&self) -> usize {
        self.sentinels.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.sentinels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::PartitionInfo;

    fn descriptor(name: &str, parts: &[(u32, &str)]) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.to_string(),
            partitions: parts
                .iter()
                .map(|(n, part)| {
                    (
                        *n,
                        PartitionInfo {
                            kname: format!("sdb{}", n),
                            name: part.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_record_and_lookup() {
        let mut registry = Registry::new();
        let device = registry.record_device("usb-1", descriptor("Stick_8G", &[(1, "A_8G")]));
        assert_eq!(device.name, "Stick_8G");
        assert_eq!(device.mounted_count(), 0);

        registry.set_mounted("usb-1", 1, true);
        registry.record_sentinel("/m/_UNMOUNT/x", "usb-1");

        assert_eq!(
            registry.lookup_device_by_sentinel(Path::new("/m/_UNMOUNT/x")),
            Some("usb-1")
        );
        assert_eq!(registry.sentinel_of("usb-1"), Some(Path::new("/m/_UNMOUNT/x")));
        assert_eq!(registry.device("usb-1").unwrap().mounted_count(), 1);
        assert_eq!(registry.all_partitions_of("usb-1").count(), 1);
        assert_eq!(registry.all_partitions_of("usb-2").count(), 0);
    }

    #[test]
    fn test_same_name_different_devices() {
        let mut registry = Registry::new();
        registry.record_device("usb-1", descriptor("Stick_8G", &[]));
        registry.record_device("usb-2", descriptor("Stick_8G", &[]));
        registry.record_device("usb-3", descriptor("Stick_8G", &[]));

        assert_eq!(registry.device("usb-1").unwrap().name, "Stick_8G");
        assert_eq!(registry.device("usb-2").unwrap().name, "Stick_8G_2");
        assert_eq!(registry.device("usb-3").unwrap().name, "Stick_8G_3");

        // Re-recording a device keeps its own name available to itself.
        registry.record_device("usb-1", descriptor("Stick_8G", &[]));
        assert_eq!(registry.device("usb-1").unwrap().name, "Stick_8G");
    }

    #[test]
    fn test_record_resets_partitions() {
        let mut registry = Registry::new();
        registry.record_device("usb-1", descriptor("D", &[(1, "A"), (2, "B")]));
        registry.set_mounted("usb-1", 2, true);
        registry.record_device("usb-1", descriptor("D", &[(1, "A")]));

        let partitions: Vec<_> = registry.all_partitions_of("usb-1").collect();
        assert_eq!(partitions.len(), 1);
        assert!(!partitions[0].1.mounted);
    }

    #[test]
    fn test_remove_device_clears_sentinels() {
        let mut registry = Registry::new();
        registry.record_device("usb-1", descriptor("D", &[]));
        registry.record_sentinel("/s/1", "usb-1");
        registry.record_device("usb-2", descriptor("E", &[]));
        registry.record_sentinel("/s/2", "usb-2");

        assert!(registry.remove_device("usb-1").is_some());
        assert_eq!(registry.lookup_device_by_sentinel(Path::new("/s/1")), None);
        assert_eq!(registry.sentinel_count(), 1);

        assert_eq!(registry.remove_sentinel(Path::new("/s/2")).as_deref(), Some("usb-2"));
        assert!(registry.remove_device("usb-2").is_some());
        assert!(registry.is_empty());
    }
}
