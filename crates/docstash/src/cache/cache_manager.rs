//! Cache Manager - disk usage accounting, free-space checks and LRU eviction.
//!
//! The manager knows nothing about keys or freshness. It sees the cache root as
//! a tree of files: artifacts, their `.meta.json` side-cars, and the manifest
//! files at the root (which it never counts or deletes).
//!
//! # Example
//!
//! ```rust,no_run
//! use docstash::cache::{CacheLimits, CacheManager, SysinfoProbe};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheManager::new("/var/cache/docstash", CacheLimits::default(), Box::new(SysinfoProbe));
//! let usage = cache.current_usage()?;
//! println!("{} files, {} bytes", usage.file_count, usage.total_bytes);
//!
//! let report = cache.clean_cache(100 * 1024 * 1024)?;
//! println!("evicted {} files", report.evicted_count);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use super::disk::DiskSpaceProbe;
use super::{is_sidecar, sidecar_path};
use crate::config::StashConfig;
use crate::error::StashResult;
use crate::manifest::MANIFEST_FILE;

/// Size thresholds for the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLimits {
    /// Eviction keeps usage at or below this.
    pub max_cache_bytes: u64,
    /// Free space that must remain on the volume.
    pub min_free_bytes: u64,
    /// Rank by access time when available; otherwise modification time only.
    pub use_access_time: bool,
}

impl Default for CacheLimits {
    fn default() -> Self {
        let config = StashConfig::default();
        Self::from(&config)
    }
}

impl From<&StashConfig> for CacheLimits {
    fn from(config: &StashConfig) -> Self {
        Self {
            max_cache_bytes: config.max_cache_bytes,
            min_free_bytes: config.min_free_bytes,
            use_access_time: config.use_access_time,
        }
    }
}

/// Result of one walk over the cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheUsage {
    pub total_bytes: u64,
    pub file_count: u64,
    /// Bytes per category (lower-cased extension, `metadata` for side-cars,
    /// `other` for files without an extension).
    pub by_category: BTreeMap<String, u64>,
}

/// Outcome of [`CacheManager::check_disk_space`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskSpaceCheck {
    pub sufficient: bool,
    /// `None` when the volume could not be queried.
    pub free_bytes: Option<u64>,
    /// `max(requested, floor)`.
    pub required_bytes: u64,
    pub message: String,
}

/// Which timestamp ranked an eviction candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTimeSource {
    Accessed,
    Modified,
}

/// An evictable artifact. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub path: PathBuf,
    pub last_access: SystemTime,
    pub access_source: AccessTimeSource,
    /// Artifact plus side-car.
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub evicted_count: u64,
    pub evicted_bytes: u64,
    pub evicted_paths: Vec<PathBuf>,
    pub usage_before: u64,
    pub usage_after: u64,
    /// False when the pass ran out of candidates before meeting its goals.
    pub satisfied: bool,
}

/// Last-access timestamp used for LRU ranking.
///
/// With access times enabled and readable, the later of atime and mtime is
/// used (a freshly written file that was never read still counts as recent).
/// When atime is unavailable or disabled, mtime alone decides. A file with
/// neither sorts first.
pub fn last_access(
    accessed: io::Result<SystemTime>,
    modified: io::Result<SystemTime>,
    use_access_time: bool,
) -> (SystemTime, AccessTimeSource) {
    let modified = modified.ok();
    match (use_access_time, accessed.ok()) {
        (true, Some(atime)) => {
            let when = modified.map_or(atime, |mtime| atime.max(mtime));
            (when, AccessTimeSource::Accessed)
        }
        _ => (
            modified.unwrap_or(UNIX_EPOCH),
            AccessTimeSource::Modified,
        ),
    }
}

/// Disk-space-aware manager for one cache root.
pub struct CacheManager {
    root: PathBuf,
    limits: CacheLimits,
    probe: Box<dyn DiskSpaceProbe>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.root)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(root: impl Into<PathBuf>, limits: CacheLimits, probe: Box<dyn DiskSpaceProbe>) -> Self {
        Self {
            root: root.into(),
            limits,
            probe,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    /// Walks the cache root once and sums file sizes by category.
    pub fn current_usage(&self) -> StashResult<CacheUsage> {
        let mut usage = CacheUsage::default();
        for (path, len) in self.cache_files()? {
            usage.total_bytes += len;
            usage.file_count += 1;
            *usage.by_category.entry(category(&path)).or_insert(0) += len;
        }
        Ok(usage)
    }

    /// Compares free space against `max(required_bytes, min_free_bytes)`.
    ///
    /// A volume that cannot be queried is reported as sufficient with
    /// `free_bytes: None`; the write itself will surface any real shortage.
    pub fn check_disk_space(&self, required_bytes: u64) -> DiskSpaceCheck {
        let required = required_bytes.max(self.limits.min_free_bytes);

        match self.probe.available_bytes(&self.root) {
            Ok(free) if free >= required => DiskSpaceCheck {
                sufficient: true,
                free_bytes: Some(free),
                required_bytes: required,
                message: format!("{} bytes free, {} required", free, required),
            },
            Ok(free) => DiskSpaceCheck {
                sufficient: false,
                free_bytes: Some(free),
                required_bytes: required,
                message: format!(
                    "{} bytes free on {}, {} required",
                    free,
                    self.root.display(),
                    required
                ),
            },
            Err(e) => {
                log::warn!(
                    "Could not query free space for {}: {}",
                    self.root.display(),
                    e
                );
                DiskSpaceCheck {
                    sufficient: true,
                    free_bytes: None,
                    required_bytes: required,
                    message: format!("free space unknown ({})", e),
                }
            }
        }
    }

    /// Evictable artifacts, least recently accessed first.
    pub fn eviction_candidates(&self) -> StashResult<Vec<EvictionCandidate>> {
        let files = self.cache_files()?;
        let sizes: HashMap<&Path, u64> = files.iter().map(|(p, len)| (p.as_path(), *len)).collect();

        let mut candidates = Vec::new();
        for (path, len) in &files {
            let mut size = *len;
            if is_sidecar(path) {
                // Side-cars ride along with their artifact; orphans stand alone.
                if sizes.contains_key(artifact_for_sidecar(path).as_path()) {
                    continue;
                }
            } else if let Some(meta_len) = sizes.get(sidecar_path(path).as_path()) {
                size += meta_len;
            }

            let metadata = match fs::metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("Skipping {} during eviction scan: {}", path.display(), e);
                    continue;
                }
            };
            let (last_access, access_source) = last_access(
                metadata.accessed(),
                metadata.modified(),
                self.limits.use_access_time,
            );

            candidates.push(EvictionCandidate {
                path: path.clone(),
                last_access,
                access_source,
                size_bytes: size,
            });
        }

        candidates.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(candidates)
    }

    /// Deletes least-recently-accessed artifacts until usage is within the
    /// configured maximum and, when `target_free_bytes > 0`, the volume has at
    /// least `max(target_free_bytes, min_free_bytes)` free.
    ///
    /// Runs out of candidates gracefully: whatever could be deleted is deleted
    /// and the report says `satisfied: false`.
    pub fn evict_lru(&self, target_free_bytes: u64) -> StashResult<EvictionReport> {
        self.evict_with(self.limits.max_cache_bytes, target_free_bytes, &[])
    }

    /// Like [`CacheManager::evict_lru`] but never deletes any path in `protected`.
    pub fn evict_lru_excluding(
        &self,
        target_free_bytes: u64,
        protected: &[PathBuf],
    ) -> StashResult<EvictionReport> {
        self.evict_with(self.limits.max_cache_bytes, target_free_bytes, protected)
    }

    /// Shrinks the cache to at most `target_size` bytes.
    pub fn clean_cache(&self, target_size: u64) -> StashResult<EvictionReport> {
        self.evict_with(target_size, 0, &[])
    }

    fn evict_with(
        &self,
        max_bytes: u64,
        target_free_bytes: u64,
        protected: &[PathBuf],
    ) -> StashResult<EvictionReport> {
        let usage_before = self.current_usage()?.total_bytes;
        let headroom_goal = target_free_bytes.max(self.limits.min_free_bytes);
        let free_before = if target_free_bytes > 0 {
            self.probe.available_bytes(&self.root).ok()
        } else {
            None
        };
        let short_of_headroom = |freed: u64| match free_before {
            Some(free) => free.saturating_add(freed) < headroom_goal,
            None => false,
        };

        let protected: HashSet<&Path> = protected.iter().map(|p| p.as_path()).collect();
        let mut report = EvictionReport {
            usage_before,
            ..EvictionReport::default()
        };
        let mut usage = usage_before;

        for candidate in self.eviction_candidates()? {
            if usage <= max_bytes && !short_of_headroom(report.evicted_bytes) {
                break;
            }
            if protected.contains(candidate.path.as_path()) {
                continue;
            }

            if let Err(e) = self.remove_artifact(&candidate.path) {
                log::warn!("Failed to evict {}: {}", candidate.path.display(), e);
                continue;
            }
            log::debug!(
                "Evicted {} ({} bytes, last access {:?})",
                candidate.path.display(),
                candidate.size_bytes,
                candidate.access_source
            );
            usage = usage.saturating_sub(candidate.size_bytes);
            report.evicted_count += 1;
            report.evicted_bytes += candidate.size_bytes;
            report.evicted_paths.push(candidate.path);
        }

        report.usage_after = self.current_usage()?.total_bytes;
        report.satisfied =
            report.usage_after <= max_bytes && !short_of_headroom(report.evicted_bytes);

        if report.evicted_count > 0 {
            log::info!(
                "Evicted {} artifacts ({} bytes), cache usage {} -> {} bytes",
                report.evicted_count,
                report.evicted_bytes,
                report.usage_before,
                report.usage_after
            );
        }
        if !report.satisfied {
            log::warn!(
                "Eviction could not reach its goal: usage {} bytes (max {}), {} bytes freed",
                report.usage_after,
                max_bytes,
                report.evicted_bytes
            );
        }
        Ok(report)
    }

    /// Deletes an artifact, its side-car, and any parent directories left
    /// empty below the cache root.
    pub fn remove_artifact(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let sidecar = sidecar_path(path);
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
        self.prune_empty_parents(path);
        Ok(())
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails (and stops) on the first non-empty directory.
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    /// Every counted file under the root with its size.
    fn cache_files(&self) -> StashResult<Vec<(PathBuf, u64)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("Skipping unreadable cache path: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || self.is_manifest_file(entry.path()) {
                continue;
            }
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push((entry.into_path(), len));
        }
        Ok(files)
    }

    fn is_manifest_file(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(MANIFEST_FILE))
                .unwrap_or(false)
    }
}

fn artifact_for_sidecar(sidecar: &Path) -> PathBuf {
    let name = sidecar
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(super::SIDECAR_SUFFIX))
        .unwrap_or_default();
    sidecar.with_file_name(name)
}

fn category(path: &Path) -> String {
    if is_sidecar(path) {
        return "metadata".to_string();
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "other".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FixedSpaceProbe;
    use filetime::FileTime;
    use std::time::Duration;
    use tempfile::TempDir;

    fn limits(max: u64, floor: u64) -> CacheLimits {
        CacheLimits {
            max_cache_bytes: max,
            min_free_bytes: floor,
            use_access_time: true,
        }
    }

    fn manager(dir: &TempDir, limits: CacheLimits, free: u64) -> CacheManager {
        CacheManager::new(dir.path(), limits, Box::new(FixedSpaceProbe::new(free)))
    }

    /// Writes `<root>/<key>/doc.bin` with `len` bytes and sets both timestamps
    /// to `age_secs` seconds after a fixed epoch.
    fn artifact_at(dir: &TempDir, key: &str, len: usize, age_secs: u64) -> PathBuf {
        let path = dir.path().join(key).join("doc.bin");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0u8; len]).unwrap();
        let when = FileTime::from_system_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000 + age_secs));
        filetime::set_file_times(&path, when, when).unwrap();
        path
    }

    #[test]
    fn test_last_access_prefers_atime() {
        let atime = UNIX_EPOCH + Duration::from_secs(200);
        let mtime = UNIX_EPOCH + Duration::from_secs(100);

        let (when, source) = last_access(Ok(atime), Ok(mtime), true);
        assert_eq!(when, atime);
        assert_eq!(source, AccessTimeSource::Accessed);

        // Never read since written: mtime is later.
        let (when, _) = last_access(Ok(mtime), Ok(atime), true);
        assert_eq!(when, atime);
    }

    #[test]
    fn test_last_access_falls_back_to_mtime() {
        let mtime = UNIX_EPOCH + Duration::from_secs(100);
        let unsupported = || Err(io::Error::new(io::ErrorKind::Unsupported, "no atime"));

        let (when, source) = last_access(unsupported(), Ok(mtime), true);
        assert_eq!(when, mtime);
        assert_eq!(source, AccessTimeSource::Modified);

        let (when, source) = last_access(Ok(UNIX_EPOCH + Duration::from_secs(999)), Ok(mtime), false);
        assert_eq!(when, mtime);
        assert_eq!(source, AccessTimeSource::Modified);

        let (when, _) = last_access(unsupported(), unsupported(), true);
        assert_eq!(when, UNIX_EPOCH);
    }

    #[test]
    fn test_current_usage_by_category_skips_manifest() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{}").unwrap();
        fs::write(dir.path().join("manifest.json.bak"), b"{}").unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/report.PDF"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("a/report.PDF.meta.json"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("a/record.json"), vec![0u8; 30]).unwrap();
        fs::write(dir.path().join("a/blob"), vec![0u8; 5]).unwrap();

        let usage = manager(&dir, limits(1000, 0), u64::MAX).current_usage().unwrap();
        assert_eq!(usage.total_bytes, 145);
        assert_eq!(usage.file_count, 4);
        assert_eq!(usage.by_category.get("pdf"), Some(&100));
        assert_eq!(usage.by_category.get("metadata"), Some(&10));
        assert_eq!(usage.by_category.get("json"), Some(&30));
        assert_eq!(usage.by_category.get("other"), Some(&5));
    }

    #[test]
    fn test_check_disk_space_uses_floor() {
        let dir = TempDir::new().unwrap();

        let check = manager(&dir, limits(0, 500), 400).check_disk_space(100);
        assert!(!check.sufficient);
        assert_eq!(check.required_bytes, 500);
        assert_eq!(check.free_bytes, Some(400));

        let check = manager(&dir, limits(0, 500), 600).check_disk_space(100);
        assert!(check.sufficient);

        let check = manager(&dir, limits(0, 10), 600).check_disk_space(700);
        assert!(!check.sufficient);
        assert_eq!(check.required_bytes, 700);
    }

    #[test]
    fn test_check_disk_space_probe_failure_is_sufficient() {
        struct Broken;
        impl DiskSpaceProbe for Broken {
            fn available_bytes(&self, _: &Path) -> io::Result<u64> {
                Err(io::Error::new(io::ErrorKind::Other, "statvfs failed"))
            }
        }

        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(dir.path(), limits(0, 500), Box::new(Broken));
        let check = cache.check_disk_space(100);
        assert!(check.sufficient);
        assert_eq!(check.free_bytes, None);
    }

    #[test]
    fn test_evict_lru_exact_order() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for i in 0..10 {
            // Write out of order so directory order differs from access order.
            let key = format!("rec-{}", (i * 7) % 10);
            let age = ((i * 7) % 10) as u64 * 60;
            paths.push((age, artifact_at(&dir, &key, 100, age)));
        }
        paths.sort();

        let cache = manager(&dir, limits(750, 0), u64::MAX);
        let report = cache.evict_lru(0).unwrap();

        // ceil((1000 - 750) / 100) = 3 oldest files
        let expected: Vec<PathBuf> = paths.iter().take(3).map(|(_, p)| p.clone()).collect();
        assert_eq!(report.evicted_paths, expected);
        assert_eq!(report.evicted_count, 3);
        assert_eq!(report.evicted_bytes, 300);
        assert_eq!(report.usage_before, 1000);
        assert_eq!(report.usage_after, 700);
        assert!(report.satisfied);
        assert!(cache.current_usage().unwrap().total_bytes <= 750);

        // Parent directories of evicted files are gone.
        for path in &expected {
            assert!(!path.parent().unwrap().exists());
        }
    }

    #[test]
    fn test_evict_lru_mtime_fallback_order() {
        let dir = TempDir::new().unwrap();
        let old = artifact_at(&dir, "old", 100, 0);
        let new = artifact_at(&dir, "new", 100, 600);
        // Read the old file's atime forward; mtime-only ranking must ignore it.
        filetime::set_file_atime(&old, FileTime::from_system_time(SystemTime::now())).unwrap();

        let cache = CacheManager::new(
            dir.path(),
            CacheLimits {
                max_cache_bytes: 100,
                min_free_bytes: 0,
                use_access_time: false,
            },
            Box::new(FixedSpaceProbe::unlimited()),
        );
        let candidates = cache.eviction_candidates().unwrap();
        assert_eq!(candidates[0].access_source, AccessTimeSource::Modified);

        let report = cache.evict_lru(0).unwrap();
        assert_eq!(report.evicted_paths, vec![old]);
        assert!(new.exists());
    }

    #[test]
    fn test_evict_removes_sidecar_and_counts_it() {
        let dir = TempDir::new().unwrap();
        let old = artifact_at(&dir, "old", 100, 0);
        fs::write(sidecar_path(&old), vec![0u8; 20]).unwrap();
        artifact_at(&dir, "new", 100, 600);

        let cache = manager(&dir, limits(150, 0), u64::MAX);
        let candidates = cache.eviction_candidates().unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].size_bytes, 120);

        let report = cache.evict_lru(0).unwrap();
        assert_eq!(report.evicted_bytes, 120);
        assert!(!sidecar_path(&old).exists());
        assert!(!dir.path().join("old").exists());
        assert_eq!(report.usage_after, 100);
    }

    #[test]
    fn test_evict_for_headroom() {
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            artifact_at(&dir, &format!("k{}", i), 100, i * 10);
        }

        // Under budget, but the volume has 50 bytes free and 250 are wanted.
        let cache = manager(&dir, limits(10_000, 0), 50);
        let report = cache.evict_lru(250).unwrap();
        assert_eq!(report.evicted_count, 2);
        assert!(report.satisfied);
        assert!(dir.path().join("k2").exists());
    }

    #[test]
    fn test_partial_eviction_reports_unsatisfied() {
        let dir = TempDir::new().unwrap();
        artifact_at(&dir, "a", 100, 0);
        artifact_at(&dir, "b", 100, 10);

        let cache = manager(&dir, limits(10_000, 1_000_000), 0);
        let report = cache.evict_lru(1).unwrap();
        assert_eq!(report.evicted_count, 2);
        assert!(!report.satisfied);
        assert_eq!(report.usage_after, 0);
    }

    #[test]
    fn test_protected_paths_survive() {
        let dir = TempDir::new().unwrap();
        let oldest = artifact_at(&dir, "a", 100, 0);
        let middle = artifact_at(&dir, "b", 100, 10);
        artifact_at(&dir, "c", 100, 20);

        let cache = manager(&dir, limits(200, 0), u64::MAX);
        let report = cache.evict_lru_excluding(0, &[oldest.clone()]).unwrap();
        assert_eq!(report.evicted_paths, vec![middle]);
        assert!(oldest.exists());
    }

    #[test]
    fn test_clean_cache_to_target_size() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), vec![b' '; 4096]).unwrap();
        for i in 0..5 {
            artifact_at(&dir, &format!("k{}", i), 100, i * 10);
        }

        let cache = manager(&dir, limits(10_000, 0), u64::MAX);
        let report = cache.clean_cache(250).unwrap();
        assert_eq!(report.evicted_count, 3);
        assert_eq!(report.usage_after, 200);
        assert!(dir.path().join(MANIFEST_FILE).exists());

        let report = cache.clean_cache(0).unwrap();
        assert_eq!(report.usage_after, 0);
        assert!(dir.path().join(MANIFEST_FILE).exists());
        assert!(report.satisfied);
    }

    #[test]
    fn test_empty_or_missing_root() {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(
            dir.path().join("nope"),
            limits(0, 0),
            Box::new(FixedSpaceProbe::unlimited()),
        );
        assert_eq!(cache.current_usage().unwrap(), CacheUsage::default());
        let report = cache.evict_lru(0).unwrap();
        assert_eq!(report.evicted_count, 0);
        assert!(report.satisfied);
    }
}
