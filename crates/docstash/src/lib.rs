//! docstash - resilient retrieval with a bounded, TTL-tiered disk cache.
//!
//! Fetches slow-changing documents and records from a rate-limited HTTP source,
//! keeps them on disk under a size budget, and refetches only what has gone
//! stale.
//!
//! # Components
//!
//! ```text
//! RetrievalOrchestrator      get_or_fetch / batch
//!   ├─► ManifestStore        key -> CacheEntry, atomic JSON with .bak
//!   ├─► CacheManager         usage, free-space floor, LRU eviction
//!   └─► ResilientFetcher     rate limit, retry, circuit breaker, body check
//!         └─► HttpTransport  one GET (ureq in production)
//! ```
//!
//! A refetch failure with an older copy on disk is not an error: it comes back
//! as [`Retrieval::Stale`] carrying the cause.
//!
//! The cache directory is meant for one process at a time; nothing locks the
//! manifest against concurrent writers.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod manifest;
pub mod orchestrator;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cache::{CacheLimits, CacheManager, DiskSpaceProbe, EvictionReport, SysinfoProbe};
pub use catalog::{RequestResolver, UrlTemplate};
pub use config::StashConfig;
pub use error::{StashError, StashResult};
pub use fetcher::{ContentCheck, FetchAttemptResult, FetchRequest, ResilientFetcher};
pub use manifest::{CacheEntry, EntryStatus, ManifestStore, ManifestSummary, TtlClass, TtlPolicy};
pub use orchestrator::{
    Artifact, BatchItem, BatchOutcome, BatchProgress, BatchReport, Retrieval,
    RetrievalOrchestrator,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError, UreqTransport};

pub use docstash_core::http::{CircuitConfig, CircuitState, RetryPolicy};
