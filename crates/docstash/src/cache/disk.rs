//! Free-space probes.

use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Source of free-space figures for the volume holding a path.
pub trait DiskSpaceProbe {
    /// Bytes available to the current user on the volume containing `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by `sysinfo`'s disk list.
///
/// Picks the disk whose mount point is the longest prefix of the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl SysinfoProbe {
    pub fn new() -> Self {
        Self
    }
}

impl DiskSpaceProbe for SysinfoProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let resolved = existing_ancestor(path)?;
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted volume contains {}", resolved.display()),
                )
            })
    }
}

/// Canonical form of `path`, or of its nearest ancestor that exists.
fn existing_ancestor(path: &Path) -> io::Result<PathBuf> {
    for candidate in path.ancestors() {
        if candidate.as_os_str().is_empty() {
            continue;
        }
        if let Ok(canonical) = candidate.canonicalize() {
            return Ok(canonical);
        }
    }
    std::env::current_dir()?.canonicalize()
}

/// Probe that always reports the same figure. Useful for tests and for
/// deployments that enforce quotas outside the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe {
    available: u64,
}

impl FixedSpaceProbe {
    pub fn new(available: u64) -> Self {
        Self { available }
    }

    /// A probe that never constrains writes.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }
}

impl DiskSpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.available)
    }
}
