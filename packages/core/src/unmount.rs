//! Unmounting a device.
//!
//! Some daemons (smbd in particular) keep a mount point busy for as long as
//! they run, so configured processes holding a mount path open are killed
//! before `umount` is attempted. The attempt is best effort: every partition
//! is tried even after one fails.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::executor::{Alert, Host};
use crate::mount::remove_mount_point;
use crate::registry::Registry;

/// Kills every configured holder of `target`.
fn release_holders(host: &dyn Host, kill_list: &[String], target: &Path) -> Result<()> {
    for process in kill_list {
        for pid in host.holders(target, process)? {
            info!(pid, process = %process, "killing holder of {}", target.display());
            host.kill(pid)?;
        }
    }
    Ok(())
}

/// Unmounts every mounted partition of device `id`.
///
/// Returns true only if all partitions were unmounted. In that case the
/// device's unmount file is forgotten and its mount tree removed. Each
/// partition that fails is reported with a failure alert.
pub fn unmount_device(
    host: &dyn Host,
    settings: &Settings,
    registry: &mut Registry,
    id: &str,
) -> bool {
    let Some(device) = registry.device(id).cloned() else {
        return true;
    };

    let mut errors = 0;
    for (number, partition) in device.partitions.iter().filter(|(_, p)| p.mounted) {
        let target = settings.partition_path(&device.name, &partition.name);
        if !host.is_mounted(&target).unwrap_or(true) {
            warn!(device = %id, path = %target.display(), "partition is no longer mounted");
            registry.set_mounted(id, *number, false);
            remove_mount_point(&target);
            continue;
        }

        info!(device = %id, "unmounting {}", target.display());
        let result = release_holders(host, &settings.kill, &target).and_then(|()| host.unmount(&target));
        match result {
            Ok(()) => {
                registry.set_mounted(id, *number, false);
                remove_mount_point(&target);
            }
            Err(e) => {
                errors += 1;
                warn!(device = %id, partition = %partition.name, "error unmounting, skipping: {}", e);
                if settings.beep {
                    host.alert(Alert::Failure);
                }
            }
        }
    }

    if errors > 0 {
        return false;
    }

    let sentinel = settings.sentinel_path(&device.name);
    registry.remove_sentinel(&sentinel);

    let root = settings.device_root(&device.name);
    match fs::remove_dir_all(&root) {
        Ok(()) => info!(device = %id, "removed {}", root.display()),
        Err(e) => warn!(device = %id, "could not remove {}: {}", root.display(), e),
    }
    if settings.beep {
        host.alert(Alert::Success);
    }

    true
}
