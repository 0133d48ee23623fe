//! Retrieval Orchestrator - the entry point upstream code uses.
//!
//! For one key:
//!
//! 1. A fresh manifest entry with its artifact on disk is a hit; no network.
//! 2. Otherwise make room (disk-space check, LRU eviction if short). Still
//!    short means `InsufficientDiskSpace` without touching the network.
//! 3. Fetch, write the artifact (temp file + rename), record it in the manifest.
//! 4. If the fetch fails and an older copy exists, serve it as
//!    [`Retrieval::Stale`] instead of failing.
//!
//! Batches run the same steps key by key, in order, isolating failures.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::cache::{
    sidecar_path, CacheLimits, CacheManager, CacheUsage, DiskSpaceProbe, EvictionReport,
    SysinfoProbe, SIDECAR_SUFFIX,
};
use crate::catalog::RequestResolver;
use crate::config::StashConfig;
use crate::error::{StashError, StashResult};
use crate::fetcher::{FetchRequest, ResilientFetcher, DEFAULT_FILE_NAME};
use crate::manifest::{CacheEntry, ManifestStore, ManifestSummary, TtlClass, MANIFEST_FILE};
use crate::transport::{HttpTransport, UreqTransport};
use docstash_core::http::CircuitState;

const PARTIAL_SUFFIX: &str = ".partial";

/// A cached artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
    pub ttl_class: TtlClass,
    pub sha256: Option<String>,
}

impl Artifact {
    pub fn read(&self) -> StashResult<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }
}

impl From<&CacheEntry> for Artifact {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            path: entry.location.clone(),
            size_bytes: entry.size_bytes,
            fetched_at: entry.fetched_at,
            ttl_class: entry.ttl_class,
            sha256: entry.sha256.clone(),
        }
    }
}

/// Successful outcome of [`RetrievalOrchestrator::get_or_fetch`].
#[derive(Debug)]
pub enum Retrieval {
    /// Fresh cached copy; no network call was made.
    Hit(Artifact),
    /// Newly fetched and cached.
    Fetched(Artifact),
    /// The refetch failed; this is the older cached copy.
    Stale { artifact: Artifact, cause: StashError },
}

impl Retrieval {
    pub fn artifact(&self) -> &Artifact {
        match self {
            Retrieval::Hit(artifact)
            | Retrieval::Fetched(artifact)
            | Retrieval::Stale { artifact, .. } => artifact,
        }
    }

    pub fn into_artifact(self) -> Artifact {
        match self {
            Retrieval::Hit(artifact)
            | Retrieval::Fetched(artifact)
            | Retrieval::Stale { artifact, .. } => artifact,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Retrieval::Hit(_))
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self, Retrieval::Fetched(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Retrieval::Stale { .. })
    }
}

/// Per-key result within a batch.
#[derive(Debug)]
pub enum BatchOutcome {
    Fetched,
    /// A fresh cached copy existed.
    Skipped,
    Stale { cause: StashError },
    Failed(StashError),
}

#[derive(Debug)]
pub struct BatchItem {
    pub key: String,
    pub outcome: BatchOutcome,
}

/// Snapshot handed to the progress callback after each key.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub stale: usize,
    pub failed: usize,
    pub elapsed: Duration,
    /// Estimated time remaining, from the average time per key so far.
    pub eta: Duration,
    pub current_key: String,
}

impl BatchProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f32 / self.total as f32
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// One item per processed key, in input order.
    pub items: Vec<BatchItem>,
    pub fetched: usize,
    pub skipped: usize,
    pub stale: usize,
    pub failed: usize,
    /// The callback asked to stop before every key was processed.
    pub stopped_early: bool,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = (&str, &StashError)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            BatchOutcome::Failed(err) => Some((item.key.as_str(), err)),
            _ => None,
        })
    }
}

/// Owns the manifest, the cache manager and the fetcher for one cache root.
///
/// # Example
///
/// ```rust,no_run
/// use docstash::{RetrievalOrchestrator, StashConfig, TtlClass, UrlTemplate};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = StashConfig::from_env()?;
/// let resolver = UrlTemplate::new("https://data.example.org/records/{key}.json")
///     .with_ttl_class(TtlClass::SafetyCritical);
/// let mut stash = RetrievalOrchestrator::open(config, resolver)?;
///
/// let retrieval = stash.get_or_fetch("1234", false)?;
/// if retrieval.is_stale() {
///     eprintln!("serving an older copy");
/// }
/// let bytes = retrieval.artifact().read()?;
/// # let _ = bytes;
/// # Ok(())
/// # }
/// ```
pub struct RetrievalOrchestrator {
    config: StashConfig,
    resolver: Box<dyn RequestResolver>,
    manifest: ManifestStore,
    cache: CacheManager,
    fetcher: ResilientFetcher,
}

impl RetrievalOrchestrator {
    /// Orchestrator over the real HTTP transport and the system disk probe.
    pub fn open(config: StashConfig, resolver: impl RequestResolver + 'static) -> StashResult<Self> {
        let transport = Box::new(UreqTransport::new(&config));
        Self::with_parts(config, Box::new(resolver), transport, Box::new(SysinfoProbe::new()))
    }

    /// Orchestrator over caller-supplied collaborators.
    pub fn with_parts(
        config: StashConfig,
        resolver: Box<dyn RequestResolver>,
        transport: Box<dyn HttpTransport>,
        probe: Box<dyn DiskSpaceProbe>,
    ) -> StashResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.cache_dir)?;

        let manifest = ManifestStore::open(&config.cache_dir, config.ttl.clone())?;
        let cache = CacheManager::new(&config.cache_dir, CacheLimits::from(&config), probe);
        let fetcher = ResilientFetcher::new(&config, transport);

        log::debug!(
            "RetrievalOrchestrator opened at {} ({} manifest entries)",
            config.cache_dir.display(),
            manifest.len()
        );

        Ok(Self {
            config,
            resolver,
            manifest,
            cache,
            fetcher,
        })
    }

    pub fn config(&self) -> &StashConfig {
        &self.config
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn manifest_mut(&mut self) -> &mut ManifestStore {
        &mut self.manifest
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }

    pub fn circuit_state(&self, channel: &str) -> CircuitState {
        self.fetcher.circuit_state(channel)
    }

    /// Resolves `key` and returns a cached or freshly fetched artifact.
    pub fn get_or_fetch(&mut self, key: &str, force_refresh: bool) -> StashResult<Retrieval> {
        let request = self.resolver.resolve(key)?;
        self.get_or_fetch_request(&request, force_refresh)
    }

    /// Same as [`RetrievalOrchestrator::get_or_fetch`] for an already resolved request.
    pub fn get_or_fetch_request(
        &mut self,
        request: &FetchRequest,
        force_refresh: bool,
    ) -> StashResult<Retrieval> {
        let cached = self.manifest.get(&request.key).cloned();

        if let Some(entry) = &cached {
            if !force_refresh
                && entry.artifact_exists()
                && !self.manifest.is_stale(entry, Utc::now())
            {
                log::debug!("Cache hit for '{}'", request.key);
                self.touch(&entry.location);
                return Ok(Retrieval::Hit(Artifact::from(entry)));
            }
        }

        match self.refresh(request, cached.as_ref()) {
            Ok(artifact) => Ok(Retrieval::Fetched(artifact)),
            Err(cause) => match cached.filter(|entry| entry.artifact_exists()) {
                Some(entry) => {
                    log::warn!(
                        "Serving stale copy of '{}' (fetched {}): {}",
                        request.key,
                        entry.fetched_at,
                        cause
                    );
                    Ok(Retrieval::Stale {
                        artifact: Artifact::from(&entry),
                        cause,
                    })
                }
                None => Err(cause),
            },
        }
    }

    /// Runs [`RetrievalOrchestrator::get_or_fetch`] for each key in order.
    ///
    /// A failing key is recorded and the batch moves on. `progress` is called
    /// after every key; returning `ControlFlow::Break(())` stops the batch and
    /// leaves the remaining keys untouched.
    pub fn batch<I, S, F>(&mut self, keys: I, force_refresh: bool, mut progress: F) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(&BatchProgress) -> ControlFlow<()>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        let total = keys.len();
        let started = Instant::now();
        let mut report = BatchReport::default();

        log::info!("Starting batch of {} keys", total);

        for (index, key) in keys.iter().enumerate() {
            let outcome = match self.get_or_fetch(key, force_refresh) {
                Ok(Retrieval::Hit(_)) => {
                    report.skipped += 1;
                    BatchOutcome::Skipped
                }
                Ok(Retrieval::Fetched(_)) => {
                    report.fetched += 1;
                    BatchOutcome::Fetched
                }
                Ok(Retrieval::Stale { cause, .. }) => {
                    report.stale += 1;
                    BatchOutcome::Stale { cause }
                }
                Err(err) => {
                    log::warn!("Batch key '{}' failed: {}", key, err);
                    report.failed += 1;
                    BatchOutcome::Failed(err)
                }
            };
            report.items.push(BatchItem {
                key: key.clone(),
                outcome,
            });

            let completed = index + 1;
            let elapsed = started.elapsed();
            let snapshot = BatchProgress {
                completed,
                total,
                fetched: report.fetched,
                skipped: report.skipped,
                stale: report.stale,
                failed: report.failed,
                elapsed,
                eta: estimate_remaining(elapsed, completed, total),
                current_key: key.clone(),
            };

            if progress(&snapshot).is_break() && completed < total {
                log::info!(
                    "Batch stopped by caller after {}/{} keys",
                    completed,
                    total
                );
                report.stopped_early = true;
                break;
            }
        }

        report.elapsed = started.elapsed();
        log::info!(
            "Batch finished: {} fetched, {} skipped, {} stale, {} failed in {}ms",
            report.fetched,
            report.skipped,
            report.stale,
            report.failed,
            report.elapsed.as_millis()
        );
        report
    }

    /// Manifest totals and freshness counts, for status reporting.
    pub fn summary(&self) -> ManifestSummary {
        self.manifest.summary(Utc::now())
    }

    pub fn cache_usage(&self) -> StashResult<CacheUsage> {
        self.cache.current_usage()
    }

    /// Shrinks the cache to `target_size` bytes and drops evicted keys from the manifest.
    pub fn clean_cache(&mut self, target_size: u64) -> StashResult<EvictionReport> {
        let report = self.cache.clean_cache(target_size)?;
        self.forget_evicted(&report.evicted_paths);
        Ok(report)
    }

    /// Deletes `key`'s artifact and manifest entry. Returns false if unknown.
    pub fn invalidate(&mut self, key: &str) -> StashResult<bool> {
        match self.manifest.remove(key)? {
            Some(entry) => {
                self.cache.remove_artifact(&entry.location)?;
                log::debug!("Invalidated '{}'", key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-hashes `key`'s artifact and compares it with the recorded digest.
    ///
    /// A missing artifact fails verification; an entry without a digest passes.
    pub fn verify(&self, key: &str) -> StashResult<bool> {
        let entry = self
            .manifest
            .get(key)
            .ok_or_else(|| StashError::NotFound(format!("no cache entry for '{}'", key)))?;
        if !entry.artifact_exists() {
            return Ok(false);
        }
        let actual = sha256_hex(&fs::read(&entry.location)?);
        Ok(entry.sha256.as_deref().map_or(true, |expected| expected == actual))
    }

    /// Drops manifest entries whose artifact is gone.
    pub fn prune_missing(&mut self) -> StashResult<Vec<String>> {
        self.manifest.prune_missing()
    }

    /// Directory holding `key`'s artifact.
    pub fn key_dir(&self, key: &str) -> PathBuf {
        self.config.cache_dir.join(key_dir_name(key))
    }

    fn refresh(
        &mut self,
        request: &FetchRequest,
        previous: Option<&CacheEntry>,
    ) -> StashResult<Artifact> {
        let path = self
            .key_dir(&request.key)
            .join(artifact_file_name(&request.file_name));
        let estimate = request
            .expected_size
            .unwrap_or(self.config.default_size_estimate);
        let protected: Vec<PathBuf> = previous.map(|e| e.location.clone()).into_iter().collect();

        self.ensure_room(estimate, &protected)?;

        let body = self.fetcher.fetch(request).into_result()?;
        self.store(request, &path, &body, previous)
    }

    fn ensure_room(&mut self, required: u64, protected: &[PathBuf]) -> StashResult<()> {
        let check = self.cache.check_disk_space(required);
        if check.sufficient {
            return Ok(());
        }

        log::info!("Low disk space ({}), evicting", check.message);
        let report = self.cache.evict_lru_excluding(required, protected)?;
        self.forget_evicted(&report.evicted_paths);

        let recheck = self.cache.check_disk_space(required);
        if recheck.sufficient {
            Ok(())
        } else {
            Err(StashError::InsufficientDiskSpace {
                required_bytes: recheck.required_bytes,
                free_bytes: recheck.free_bytes.unwrap_or(0),
                message: format!(
                    "{} after evicting {} files ({} bytes)",
                    recheck.message, report.evicted_count, report.evicted_bytes
                ),
            })
        }
    }

    fn store(
        &mut self,
        request: &FetchRequest,
        path: &Path,
        body: &[u8],
        previous: Option<&CacheEntry>,
    ) -> StashResult<Artifact> {
        write_file_atomically(path, body)?;

        let entry = CacheEntry::new(&request.key, path, body.len() as u64, request.ttl_class)
            .with_source_url(&request.url)
            .with_sha256(sha256_hex(body));

        if let Err(e) = write_sidecar(path, &entry) {
            log::warn!("Failed to write metadata for '{}': {}", request.key, e);
        }

        if let Some(prev) = previous {
            if prev.location != path {
                if let Err(e) = self.cache.remove_artifact(&prev.location) {
                    log::warn!(
                        "Failed to remove previous artifact {}: {}",
                        prev.location.display(),
                        e
                    );
                }
            }
        }

        if let Err(e) = self.manifest.put(&request.key, entry.clone()) {
            log::warn!(
                "Fetched '{}' but could not record it in the manifest: {}",
                request.key,
                e
            );
        }

        self.enforce_budget(path);
        Ok(Artifact::from(&entry))
    }

    /// Evicts down to the size budget, never touching `keep`.
    fn enforce_budget(&mut self, keep: &Path) {
        let usage = match self.cache.current_usage() {
            Ok(usage) => usage,
            Err(e) => {
                log::warn!("Could not measure cache usage: {}", e);
                return;
            }
        };
        if usage.total_bytes <= self.config.max_cache_bytes {
            return;
        }

        match self.cache.evict_lru_excluding(0, &[keep.to_path_buf()]) {
            Ok(report) => self.forget_evicted(&report.evicted_paths),
            Err(e) => log::warn!("Cache budget eviction failed: {}", e),
        }
    }

    fn forget_evicted(&mut self, paths: &[PathBuf]) {
        let keys = self.manifest.keys_at(paths);
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.manifest.remove_many(&keys) {
            log::warn!("Failed to drop {} evicted keys from manifest: {}", keys.len(), e);
        }
    }

    fn touch(&self, path: &Path) {
        if !self.config.touch_on_hit {
            return;
        }
        if let Err(e) = filetime::set_file_atime(path, FileTime::now()) {
            log::debug!("Could not update access time of {}: {}", path.display(), e);
        }
    }
}

/// Directory name for `key` under the cache root.
///
/// Keys made only of `[a-z0-9._-]` are used as is, unless they could be
/// mistaken for a hidden or manifest file. Anything else, including any key
/// with an uppercase letter, is lower-cased, sanitized and suffixed with the
/// first 8 hex chars of the key's SHA-256, so keys that differ only in case
/// stay apart on case-insensitive filesystems.
pub fn key_dir_name(key: &str) -> String {
    let safe = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && !key.starts_with(MANIFEST_FILE)
        && key.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.')
        });
    if safe {
        return key.to_string();
    }

    let sanitized: String = key
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", sanitized, &sha256_hex(key.as_bytes())[..8])
}

/// Plain file name for the artifact; anything path-like or reserved falls back
/// to the default name.
fn artifact_file_name(requested: &str) -> String {
    let name = Path::new(requested)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| *n == requested)
        .filter(|n| !n.ends_with(SIDECAR_SUFFIX) && !n.ends_with(PARTIAL_SUFFIX));
    name.unwrap_or(DEFAULT_FILE_NAME).to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_file_atomically(path: &Path, bytes: &[u8]) -> StashResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(PARTIAL_SUFFIX);
    let tmp = path.with_file_name(tmp_name);

    let result = (|| -> StashResult<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_sidecar(artifact: &Path, entry: &CacheEntry) -> StashResult<()> {
    let json = serde_json::to_vec_pretty(entry)?;
    fs::write(sidecar_path(artifact), json)?;
    Ok(())
}

fn estimate_remaining(elapsed: Duration, completed: usize, total: usize) -> Duration {
    if completed == 0 || completed >= total {
        return Duration::ZERO;
    }
    let per_key = elapsed.as_secs_f64() / completed as f64;
    Duration::from_secs_f64(per_key * (total - completed) as f64)
}
