use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

use crate::config::StorageRoot;

/// One candidate volume directory found under a storage root. Rebuilt every
/// cycle; a directory may vanish or be renamed between cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDirectory {
    /// Directory name; with host-path provisioners this equals the PV name.
    pub volume_id: String,
    pub path: PathBuf,
    pub storage_class: String,
}

/// List the immediate child directories of a storage root. Symlinks are
/// classified via `symlink_metadata` and skipped, so a link pointing outside
/// the root can never be walked. Output is sorted by volume id so the final
/// sample order is deterministic.
pub fn discover_volumes(root: &StorageRoot) -> anyhow::Result<Vec<VolumeDirectory>> {
    let entries = fs::read_dir(&root.host_path)
        .with_context(|| format!("cannot read storage root {:?}", root.host_path))?;

    let mut volumes = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            // Entry vanished between readdir and stat; skip it.
            Err(err) => {
                debug!("skipping unreadable entry under {:?}: {}", root.host_path, err);
                continue;
            }
        };

        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(err) => {
                debug!("skipping vanished entry {:?}: {}", path, err);
                continue;
            }
        };

        if !meta.is_dir() {
            // Files and symlinks (including dir symlinks) are not volumes.
            continue;
        }

        let volume_id = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        volumes.push(VolumeDirectory {
            volume_id,
            path,
            storage_class: root.storage_class.clone(),
        });
    }

    volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
    Ok(volumes)
}
