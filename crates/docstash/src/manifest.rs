//! Manifest - the durable index of what is cached, when, and under which TTL tier.
//!
//! The manifest is a JSON document at `<cache_root>/manifest.json`. Every
//! mutation rewrites it atomically: the prior file is copied to
//! `manifest.json.bak`, the new state is written to `manifest.json.tmp` in the
//! same directory, then renamed over the primary. The canonical path never holds
//! a half-written file.
//!
//! Freshness is never stored. [`EntryStatus`] is derived from `fetched_at`, the
//! entry's [`TtlClass`], the configured [`TtlPolicy`], the current time, and
//! whether the artifact still exists.
//!
//! The store assumes a single process writes the cache directory. There is no
//! cross-process lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StashError, StashResult};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BACKUP_FILE: &str = "manifest.json.bak";
const TEMP_FILE: &str = "manifest.json.tmp";

/// Current on-disk manifest layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Named cache-validity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// Safety-relevant records that change often (default 24h).
    SafetyCritical,
    /// Ordinary records (default 72h).
    Standard,
    /// Historical records that rarely change (default 7 days).
    Historical,
    /// Immutable documents. Never expire; existence on disk is the freshness signal.
    Static,
}

impl TtlClass {
    pub const ALL: [TtlClass; 4] = [
        TtlClass::SafetyCritical,
        TtlClass::Standard,
        TtlClass::Historical,
        TtlClass::Static,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TtlClass::SafetyCritical => "safety_critical",
            TtlClass::Standard => "standard",
            TtlClass::Historical => "historical",
            TtlClass::Static => "static",
        }
    }
}

impl std::fmt::Display for TtlClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations for each [`TtlClass`], in seconds. Zero means "never expires".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    #[serde(default = "default_safety_critical_secs")]
    pub safety_critical_secs: u64,
    #[serde(default = "default_standard_secs")]
    pub standard_secs: u64,
    #[serde(default = "default_historical_secs")]
    pub historical_secs: u64,
    #[serde(default)]
    pub static_secs: u64,
}

fn default_safety_critical_secs() -> u64 {
    24 * 60 * 60
}

fn default_standard_secs() -> u64 {
    3 * 24 * 60 * 60
}

fn default_historical_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            safety_critical_secs: default_safety_critical_secs(),
            standard_secs: default_standard_secs(),
            historical_secs: default_historical_secs(),
            static_secs: 0,
        }
    }
}

impl TtlPolicy {
    pub fn duration(&self, class: TtlClass) -> Duration {
        let secs = match class {
            TtlClass::SafetyCritical => self.safety_critical_secs,
            TtlClass::Standard => self.standard_secs,
            TtlClass::Historical => self.historical_secs,
            TtlClass::Static => self.static_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Derived freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Fresh,
    Stale,
    Missing,
}

/// One cached artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_class: TtlClass,
    pub size_bytes: u64,
    /// Path to the artifact file.
    pub location: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Hex SHA-256 of the artifact as written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl CacheEntry {
    /// Creates an entry fetched now.
    pub fn new(
        key: impl Into<String>,
        location: impl Into<PathBuf>,
        size_bytes: u64,
        ttl_class: TtlClass,
    ) -> Self {
        Self {
            key: key.into(),
            fetched_at: Utc::now(),
            ttl_class,
            size_bytes,
            location: location.into(),
            source_url: None,
            sha256: None,
        }
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn artifact_exists(&self) -> bool {
        self.location.is_file()
    }
}

/// The full collection of entries plus aggregate counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub total_entries: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub entries: BTreeMap<String, CacheEntry>,
}

impl Manifest {
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            created_at: now,
            last_updated: now,
            total_entries: 0,
            total_bytes: 0,
            entries: BTreeMap::new(),
        }
    }

    fn recompute_totals(&mut self) {
        self.total_entries = self.entries.len() as u64;
        self.total_bytes = self.entries.values().map(|e| e.size_bytes).sum();
    }
}

/// Where [`ManifestStore::load`] found usable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// The primary manifest parsed.
    Primary,
    /// The primary was missing or corrupt; the backup was used and restored.
    Backup,
    /// Nothing usable on disk; started empty.
    Empty,
}

/// Read-only view for status and health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestSummary {
    pub total_entries: u64,
    pub total_bytes: u64,
    pub fresh: u64,
    pub stale: u64,
    pub missing: u64,
    pub by_ttl_class: BTreeMap<TtlClass, u64>,
    pub last_updated: DateTime<Utc>,
}

/// Owner of the manifest. All other components go through this API.
#[derive(Debug)]
pub struct ManifestStore {
    root: PathBuf,
    ttl: TtlPolicy,
    manifest: Manifest,
    /// Whether the primary file on disk is known to parse. A corrupt primary
    /// must not be copied over the backup.
    primary_trusted: bool,
}

impl ManifestStore {
    /// Opens the store rooted at `root`, creating the directory and loading any
    /// existing manifest.
    pub fn open(root: impl Into<PathBuf>, ttl: TtlPolicy) -> StashResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut store = Self {
            root,
            ttl,
            manifest: Manifest::empty(),
            primary_trusted: false,
        };
        store.load();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.root.join(BACKUP_FILE)
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Reloads the manifest from disk.
    ///
    /// Falls back to the backup when the primary is missing or corrupt, and
    /// restores the backup as the new primary. When neither is usable the
    /// store starts from an empty manifest; that is logged, never fatal.
    pub fn load(&mut self) -> LoadSource {
        let primary = self.manifest_path();
        let backup = self.backup_path();

        let primary_err = match read_manifest(&primary) {
            Ok(manifest) => {
                self.manifest = manifest;
                self.primary_trusted = true;
                return LoadSource::Primary;
            }
            Err(err) => err,
        };

        match read_manifest(&backup) {
            Ok(manifest) => {
                log::info!(
                    "Manifest at {} unusable ({}), recovered from backup",
                    primary.display(),
                    primary_err
                );
                self.manifest = manifest;
                match write_atomically(&self.root, &primary, &self.manifest) {
                    Ok(()) => self.primary_trusted = true,
                    Err(e) => {
                        self.primary_trusted = false;
                        log::warn!("Failed to restore manifest from backup: {}", e);
                    }
                }
                LoadSource::Backup
            }
            Err(backup_err) => {
                let had_files = primary.exists() || backup.exists();
                self.manifest = Manifest::empty();
                self.primary_trusted = !primary.exists();
                if had_files {
                    let err = StashError::ManifestCorrupt(format!(
                        "primary: {}; backup: {}",
                        primary_err, backup_err
                    ));
                    log::warn!("{}; starting from an empty manifest", err);
                }
                LoadSource::Empty
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.manifest.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.manifest.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.manifest.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.manifest.entries.values()
    }

    /// Upserts one entry and persists the whole manifest.
    ///
    /// On a write failure the in-memory state is rolled back and the error is
    /// returned; the caller decides whether to continue without caching.
    pub fn put(&mut self, key: &str, mut entry: CacheEntry) -> StashResult<()> {
        entry.key = key.to_string();
        let previous = self.manifest.entries.insert(key.to_string(), entry);

        if let Err(err) = self.persist() {
            match previous {
                Some(prev) => self.manifest.entries.insert(key.to_string(), prev),
                None => self.manifest.entries.remove(key),
            };
            self.manifest.recompute_totals();
            return Err(err);
        }
        Ok(())
    }

    /// Removes one entry, persisting if it existed.
    pub fn remove(&mut self, key: &str) -> StashResult<Option<CacheEntry>> {
        let mut removed = self.remove_many([key])?;
        Ok(removed.pop())
    }

    /// Removes several entries with a single persist.
    pub fn remove_many<I, S>(&mut self, keys: I) -> StashResult<Vec<CacheEntry>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<CacheEntry> = keys
            .into_iter()
            .filter_map(|key| self.manifest.entries.remove(key.as_ref()))
            .collect();

        if !removed.is_empty() {
            if let Err(err) = self.persist() {
                for entry in removed {
                    self.manifest.entries.insert(entry.key.clone(), entry);
                }
                self.manifest.recompute_totals();
                return Err(err);
            }
        }
        Ok(removed)
    }

    /// Keys of entries whose artifact is at one of `paths`.
    pub fn keys_at<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) -> Vec<String> {
        let mut keys = Vec::new();
        for path in paths {
            keys.extend(
                self.manifest
                    .entries
                    .values()
                    .filter(|e| &e.location == path)
                    .map(|e| e.key.clone()),
            );
        }
        keys
    }

    /// Drops entries whose artifact no longer exists on disk.
    pub fn prune_missing(&mut self) -> StashResult<Vec<String>> {
        let missing: Vec<String> = self
            .manifest
            .entries
            .values()
            .filter(|e| !e.artifact_exists())
            .map(|e| e.key.clone())
            .collect();
        self.remove_many(&missing)?;
        Ok(missing)
    }

    /// True when `entry` must be refetched.
    ///
    /// Zero-duration tiers never expire by age; they are stale only when the
    /// artifact has gone missing. Otherwise stale means `now - fetched_at > ttl`.
    pub fn is_stale(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let ttl = self.ttl.duration(entry.ttl_class);
        if ttl.is_zero() {
            return !entry.artifact_exists();
        }
        match now.signed_duration_since(entry.fetched_at).to_std() {
            Ok(age) => age > ttl,
            // fetched_at in the future (clock moved backwards)
            Err(_) => false,
        }
    }

    pub fn status(&self, entry: &CacheEntry, now: DateTime<Utc>) -> EntryStatus {
        if !entry.artifact_exists() {
            EntryStatus::Missing
        } else if self.is_stale(entry, now) {
            EntryStatus::Stale
        } else {
            EntryStatus::Fresh
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> ManifestSummary {
        let mut summary = ManifestSummary {
            total_entries: self.manifest.total_entries,
            total_bytes: self.manifest.total_bytes,
            fresh: 0,
            stale: 0,
            missing: 0,
            by_ttl_class: BTreeMap::new(),
            last_updated: self.manifest.last_updated,
        };

        for entry in self.manifest.entries.values() {
            match self.status(entry, now) {
                EntryStatus::Fresh => summary.fresh += 1,
                EntryStatus::Stale => summary.stale += 1,
                EntryStatus::Missing => summary.missing += 1,
            }
            *summary.by_ttl_class.entry(entry.ttl_class).or_insert(0) += 1;
        }
        summary
    }

    fn persist(&mut self) -> StashResult<()> {
        fs::create_dir_all(&self.root)?;
        self.manifest.last_updated = Utc::now();
        self.manifest.recompute_totals();

        let primary = self.manifest_path();
        if self.primary_trusted && primary.exists() {
            fs::copy(&primary, self.backup_path())?;
        }
        write_atomically(&self.root, &primary, &self.manifest)?;
        self.primary_trusted = true;
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<Manifest, String> {
    let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut manifest: Manifest = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    if manifest.schema_version > SCHEMA_VERSION {
        return Err(format!(
            "unsupported schema version {} (expected <= {})",
            manifest.schema_version, SCHEMA_VERSION
        ));
    }
    manifest.recompute_totals();
    Ok(manifest)
}

/// Writes `manifest` to a temp file in `dir`, syncs it, then renames over `dest`.
fn write_atomically(dir: &Path, dest: &Path, manifest: &Manifest) -> StashResult<()> {
    let tmp = dir.join(TEMP_FILE);
    let result = (|| -> StashResult<()> {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, manifest)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, dest)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
