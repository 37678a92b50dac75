//! Mount operations module.
//!
//! This module creates mount directories, mounts every partition of a probed
//! device and verifies the result against the mount table. A partition that
//! fails to mount never leaves an empty directory behind.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, IoResultExt, Result};
use crate::executor::Host;
use crate::registry::{Partition, Registry};

/// Creates a mount point directory (and its parents) with the given permission bits.
pub fn create_mount_point(path: &Path, perms: u32) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(perms)
        .create(path)
        .mount_point_context(path)
}

/// Removes an empty mount directory, logging instead of failing.
pub(crate) fn remove_mount_point(path: &Path) {
    if let Err(e) = fs::remove_dir(path) {
        warn!(path = %path.display(), "could not remove mount directory: {}", e);
    }
}

/// Mounts one partition of a device and returns its mount path.
///
/// The mount is checked against the mount table rather than trusted from the
/// tool's exit status. On failure the freshly created directory is removed.
pub fn mount_partition(
    host: &dyn Host,
    settings: &Settings,
    device_name: &str,
    partition: &Partition,
) -> Result<PathBuf> {
    let target = settings.partition_path(device_name, &partition.name);
    let source = Path::new("/dev").join(&partition.kname);
    create_mount_point(&target, settings.perms)?;

    let mounted = host.mount(&source, &target, &settings.mount_options());
    if host.is_mounted(&target).unwrap_or(false) {
        return Ok(target);
    }

    remove_mount_point(&target);
    Err(match mounted {
        Err(e) => e,
        Ok(()) => Error::Mount {
            source_path: source,
            target,
            message: "mount point missing from mount table".to_string(),
        },
    })
}

/// Mounts every recorded partition of device `id`.
///
/// Failures are per partition: siblings are still attempted. Returns the
/// number of partitions that ended up mounted.
pub fn mount_device(host: &dyn Host, settings: &Settings, registry: &mut Registry, id: &str) -> usize {
    let Some(device) = registry.device(id).cloned() else {
        return 0;
    };

    let mut mounted = 0;
    for (number, partition) in &device.partitions {
        match mount_partition(host, settings, &device.name, partition) {
            Ok(target) => {
                info!(device = %id, path = %target.display(), "mounted /dev/{}", partition.kname);
                registry.set_mounted(id, *number, true);
                mounted += 1;
            }
            Err(e) => {
                warn!(device = %id, partition = %partition.name, "mount failed: {}", e);
            }
        }
    }

    mounted
}
