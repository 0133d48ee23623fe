//! Configuration for the retrieval stack.
//!
//! [`StashConfig`] can be built in code with the `with_*` builders, loaded from
//! a JSON file, and overridden from the environment:
//!
//! | Variable                   | Field            |
//! |----------------------------|------------------|
//! | `DOCSTASH_CACHE_DIR`       | `cache_dir`      |
//! | `DOCSTASH_MAX_CACHE_BYTES` | `max_cache_bytes`|
//! | `DOCSTASH_MIN_FREE_BYTES`  | `min_free_bytes` |
//! | `DOCSTASH_API_KEY`         | `api_key`        |
//! | `DOCSTASH_USER_AGENT`      | `user_agent`     |
//!
//! The API key may be written as `$VAR_NAME`, in which case it is read from
//! that environment variable once, when the fetcher is built.

use docstash_core::http::{CircuitConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StashError, StashResult};
use crate::manifest::TtlPolicy;

pub const ENV_CACHE_DIR: &str = "DOCSTASH_CACHE_DIR";
pub const ENV_MAX_CACHE_BYTES: &str = "DOCSTASH_MAX_CACHE_BYTES";
pub const ENV_MIN_FREE_BYTES: &str = "DOCSTASH_MIN_FREE_BYTES";
pub const ENV_API_KEY: &str = "DOCSTASH_API_KEY";
pub const ENV_USER_AGENT: &str = "DOCSTASH_USER_AGENT";

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Per-channel overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Minimum spacing between requests on this channel.
    pub min_interval_ms: u64,
}

/// Everything the orchestrator, fetcher and cache manager need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashConfig {
    /// Root directory for artifacts and the manifest.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Cache size budget; eviction runs once usage exceeds it.
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,

    /// Free space that must remain on the volume after a write.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Size assumed for a fetch whose size is not known up front.
    #[serde(default = "default_size_estimate")]
    pub default_size_estimate: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// API key, or `$VAR` to read it from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Header carrying the API key. Keys never go in the URL.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Responses larger than this are rejected.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Spacing between requests on channels without an override.
    #[serde(default = "default_min_interval_ms")]
    pub default_min_interval_ms: u64,

    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,

    #[serde(default)]
    pub ttl: TtlPolicy,

    /// Rank eviction candidates by access time when the filesystem records it.
    #[serde(default = "default_true")]
    pub use_access_time: bool,

    /// Bump the access time of an artifact on every cache hit.
    #[serde(default = "default_true")]
    pub touch_on_hit: bool,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("docstash")
}

fn default_max_cache_bytes() -> u64 {
    2 * GIB
}

fn default_min_free_bytes() -> u64 {
    512 * MIB
}

fn default_size_estimate() -> u64 {
    8 * MIB
}

fn default_user_agent() -> String {
    format!("docstash/{}", env!("CARGO_PKG_VERSION"))
}

fn default_api_key_header() -> String {
    "X-Api-Key".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_body_bytes() -> u64 {
    256 * MIB
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_cache_bytes: default_max_cache_bytes(),
            min_free_bytes: default_min_free_bytes(),
            default_size_estimate: default_size_estimate(),
            user_agent: default_user_agent(),
            api_key: None,
            api_key_header: default_api_key_header(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            default_min_interval_ms: default_min_interval_ms(),
            channels: BTreeMap::new(),
            ttl: TtlPolicy::default(),
            use_access_time: true,
            touch_on_hit: true,
        }
    }
}

impl StashConfig {
    /// Default configuration rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> StashResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `DOCSTASH_*` environment overrides applied.
    pub fn from_env() -> StashResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> StashResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_MAX_CACHE_BYTES) {
            self.max_cache_bytes = parse_bytes(ENV_MAX_CACHE_BYTES, &value)?;
        }
        if let Some(value) = lookup(ENV_MIN_FREE_BYTES) {
            self.min_free_bytes = parse_bytes(ENV_MIN_FREE_BYTES, &value)?;
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(agent) = lookup(ENV_USER_AGENT).filter(|v| !v.is_empty()) {
            self.user_agent = agent;
        }
        Ok(())
    }

    pub fn with_max_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    pub fn with_default_size_estimate(mut self, bytes: u64) -> Self {
        self.default_size_estimate = bytes;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = header.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_default_min_interval(mut self, interval: Duration) -> Self {
        self.default_min_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_channel_interval(mut self, channel: impl Into<String>, interval: Duration) -> Self {
        self.channels.insert(
            channel.into(),
            ChannelConfig {
                min_interval_ms: interval.as_millis() as u64,
            },
        );
        self
    }

    pub fn with_ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_access_time(mut self, use_access_time: bool) -> Self {
        self.use_access_time = use_access_time;
        self
    }

    pub fn with_touch_on_hit(mut self, touch: bool) -> Self {
        self.touch_on_hit = touch;
        self
    }

    /// Resolve the API key.
    ///
    /// `$VAR` reads the named environment variable; any other value is used as
    /// is. Without a configured key, falls back to `DOCSTASH_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if let Some(env_var) = key.strip_prefix('$') {
                return std::env::var(env_var).ok().filter(|v| !v.is_empty());
            }
            return Some(key.clone());
        }
        std::env::var(ENV_API_KEY).ok().filter(|v| !v.is_empty())
    }

    /// Minimum request spacing for `channel`.
    pub fn min_interval_for(&self, channel: &str) -> Duration {
        let ms = self
            .channels
            .get(channel)
            .map(|c| c.min_interval_ms)
            .unwrap_or(self.default_min_interval_ms);
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> StashResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(StashError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(StashError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(StashError::Config(
                "retry.jitter_factor must be between 0.0 and 1.0".into(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(StashError::Config(
                "circuit.failure_threshold must be at least 1".into(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(StashError::Config("user_agent must not be empty".into()));
        }
        if self.api_key_header.trim().is_empty() {
            return Err(StashError::Config("api_key_header must not be empty".into()));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(StashError::Config("cache_dir must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_bytes(name: &str, value: &str) -> StashResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| StashError::Config(format!("{} must be a byte count: {}", name, e)))
}
