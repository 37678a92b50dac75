//! Unmount files.
//!
//! Mounting can be fully automated, unmounting cannot: pulling a drive is
//! unsafe and typing commands defeats the point of an automounter. Each
//! mounted device therefore gets an empty file in the unmount directory;
//! deleting it (from a file manager, a Samba share, ...) asks for the unmount.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{IoResultExt, Result};
use crate::registry::Registry;
use crate::watch::Watcher;

/// Mode of unmount files; anyone who can see them may delete them.
const SENTINEL_MODE: u32 = 0o666;

/// Creates the unmount file for device `id`, records it and starts watching it.
///
/// Returns `Ok(None)` if the device is not in the registry.
pub fn arm(
    settings: &Settings,
    registry: &mut Registry,
    watcher: &mut dyn Watcher,
    id: &str,
) -> Result<Option<PathBuf>> {
    let Some(device) = registry.device(id) else {
        return Ok(None);
    };
    let path = settings.sentinel_path(&device.name);

    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)
        .sentinel_context(&path)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(SENTINEL_MODE)).sentinel_context(&path)?;

    registry.record_sentinel(path.clone(), id);
    info!(device = %id, "adding watch for unmount file {}", path.display());
    if let Err(e) = watcher.add(&path) {
        registry.remove_sentinel(&path);
        if let Err(remove) = fs::remove_file(&path) {
            warn!(device = %id, "could not remove unwatched unmount file {}: {}", path.display(), remove);
        }
        return Err(e);
    }

    Ok(Some(path))
}

/// Stops watching the unmount file at `path`, deletes it and forgets it.
///
/// A watch that is already gone is not an error: a deleted file drops its
/// watch in the kernel, and the same path is re-armed when the device comes
/// back.
pub fn disarm(registry: &mut Registry, watcher: &mut dyn Watcher, path: &Path) -> Result<()> {
    watcher.remove(path)?;

    match fs::remove_file(path) {
        Ok(()) => debug!("removed unmount file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).sentinel_context(path),
    }

    registry.remove_sentinel(path);
    Ok(())
}
