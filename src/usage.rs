use std::ffi::CString;
use std::fs;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use tracing::debug;
use walkdir::WalkDir;

/// Result of computing usage for one volume directory.
///
/// `Vanished` means the directory itself could not be opened (removed or
/// renamed between discovery and the walk); the caller drops the volume from
/// the snapshot instead of publishing a misleading zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    Bytes(u64),
    Vanished,
}

/// Sum file sizes under `path`, recursively. Symlinks are not followed.
/// Entries that disappear mid-walk contribute nothing; they never fail the
/// computation.
///
/// `cancel` is set by a caller that has stopped waiting for the walk; the
/// partial result is discarded, the check only bounds how long the walk can
/// hold a blocking-pool thread.
pub fn directory_usage(path: &Path, cancel: &AtomicBool) -> UsageOutcome {
    if fs::symlink_metadata(path).is_err() {
        return UsageOutcome::Vanished;
    }

    let mut total: u64 = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        if cancel.load(Ordering::Relaxed) {
            return UsageOutcome::Vanished;
        }
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() {
                    match entry.metadata() {
                        Ok(meta) => total += meta.len(),
                        // Vanished between listing and stat.
                        Err(err) => debug!("skipping {:?}: {}", entry.path(), err),
                    }
                }
            }
            Err(err) => {
                if err.depth() == 0 {
                    return UsageOutcome::Vanished;
                }
                debug!("skipping unreadable entry under {:?}: {}", path, err);
            }
        }
    }

    UsageOutcome::Bytes(total)
}

/// Capacity/used/available of the filesystem backing a storage root.
#[derive(Debug, Clone, Copy)]
pub struct MountStats {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// statvfs the given path.
pub fn mount_stats(path: &Path) -> anyhow::Result<MountStats> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;

    // SAFETY: statvfs writes into the zeroed struct we hand it and the
    // C string outlives the call.
    unsafe {
        let mut stat: libc::statvfs = mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            bail!("statvfs failed for {:?}", path);
        }

        let block_size = stat.f_frsize as u64;
        let capacity_bytes = block_size * stat.f_blocks as u64;
        let available_bytes = block_size * stat.f_bavail as u64;
        let used_bytes = capacity_bytes - block_size * stat.f_bfree as u64;

        Ok(MountStats {
            capacity_bytes,
            used_bytes,
            available_bytes,
        })
    }
}
