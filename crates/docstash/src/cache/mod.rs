//! Cache module - on-disk artifact storage, usage accounting and LRU eviction.
//!
//! This module provides:
//! - `CacheManager`: usage walks, disk-space checks, LRU eviction
//! - `DiskSpaceProbe`: free-space source (`SysinfoProbe` in production)
//!
//! # Layout
//!
//! ```text
//! <cache_root>/
//!     manifest.json            (owned by ManifestStore, never evicted)
//!     manifest.json.bak
//!     <key-dir>/
//!         <file_name>          artifact
//!         <file_name>.meta.json side-car, removed with its artifact
//! ```

mod cache_manager;
mod disk;

pub use cache_manager::{
    last_access, AccessTimeSource, CacheLimits, CacheManager, CacheUsage, DiskSpaceCheck,
    EvictionCandidate, EvictionReport,
};
pub use disk::{DiskSpaceProbe, FixedSpaceProbe, SysinfoProbe};

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix of the per-artifact side-car metadata file.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Side-car path for `artifact`: `<artifact>.meta.json`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    artifact.with_file_name(name)
}

pub(crate) fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(SIDECAR_SUFFIX) && n.len() > SIDECAR_SUFFIX.len())
        .unwrap_or(false)
}
