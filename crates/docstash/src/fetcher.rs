//! Resilient Fetcher - one logical GET per call, with rate limiting, retry,
//! circuit breaking and body validation.
//!
//! # Per-call flow
//!
//! ```text
//! fetch(request)
//!   ├─ circuit open? ──────────────► CircuitOpen (no network, no limiter wait)
//!   └─ with_retry
//!        ├─ limiter.acquire()          sleep out the channel's interval
//!        ├─ transport.get()
//!        └─ classify
//!             ├─ 2xx + valid body ─────► success, circuit reset
//!             ├─ 429/5xx, network ────► retry with backoff
//!             └─ other 4xx, bad body ─► PermanentTransport, no retry
//!   exhausted ───────────────────────► RetryableTransport, one breaker failure
//! ```

use docstash_core::http::{
    classify_status, with_retry, CircuitBreaker, CircuitState, RateLimiter,
    RetryPolicy, RetryResult, RetryableError, StatusClass,
};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::StashConfig;
use crate::error::StashError;
use crate::manifest::TtlClass;
use crate::transport::{HttpRequest, HttpTransport, TransportError};

pub const DEFAULT_CHANNEL: &str = "default";
pub const DEFAULT_FILE_NAME: &str = "artifact.bin";

/// Validation applied to a 2xx body before it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentCheck {
    /// Accept any body, including an empty one.
    Any,
    /// Body must parse as JSON.
    Json,
    /// Body must start with these bytes.
    MagicBytes(Vec<u8>),
}

impl ContentCheck {
    pub fn pdf() -> Self {
        ContentCheck::MagicBytes(b"%PDF-".to_vec())
    }

    pub fn zip() -> Self {
        ContentCheck::MagicBytes(b"PK\x03\x04".to_vec())
    }

    /// `Err` carries the reason the body was rejected.
    pub fn validate(&self, body: &[u8]) -> Result<(), String> {
        match self {
            ContentCheck::Any => Ok(()),
            _ if body.is_empty() => Err("empty body".to_string()),
            ContentCheck::Json => serde_json::from_slice::<serde::de::IgnoredAny>(body)
                .map(|_| ())
                .map_err(|e| format!("body is not valid JSON: {}", e)),
            ContentCheck::MagicBytes(magic) => {
                if body.starts_with(magic) {
                    Ok(())
                } else {
                    Err(format!(
                        "body does not start with expected signature {:?}",
                        String::from_utf8_lossy(magic)
                    ))
                }
            }
        }
    }

    fn accept_header(&self) -> Option<&'static str> {
        match self {
            ContentCheck::Json => Some("application/json"),
            _ => None,
        }
    }
}

/// What to fetch for one key, and how to store it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: String,
    pub url: String,
    /// Rate-limit and circuit-breaker scope.
    pub channel: String,
    pub ttl_class: TtlClass,
    pub content_check: ContentCheck,
    /// File name of the artifact inside the key's directory.
    pub file_name: String,
    /// Size hint used for the pre-fetch disk-space check.
    pub expected_size: Option<u64>,
}

impl FetchRequest {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            ttl_class: TtlClass::Standard,
            content_check: ContentCheck::Any,
            file_name: DEFAULT_FILE_NAME.to_string(),
            expected_size: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_ttl_class(mut self, ttl_class: TtlClass) -> Self {
        self.ttl_class = ttl_class;
        self
    }

    pub fn with_content_check(mut self, check: ContentCheck) -> Self {
        self.content_check = check;
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size = Some(bytes);
        self
    }
}

/// Outcome of one logical fetch. Consumed immediately by the orchestrator.
#[derive(Debug)]
pub struct FetchAttemptResult {
    pub outcome: Result<Vec<u8>, StashError>,
    /// Network attempts made; zero when the circuit was open.
    pub attempts_used: u32,
}

impl FetchAttemptResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.outcome.as_ref().ok().map(Vec::as_slice)
    }

    pub fn error(&self) -> Option<&StashError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<Vec<u8>, StashError> {
        self.outcome
    }
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    Transport(TransportError),
    InvalidBody {
        status: u16,
        reason: String,
    },
}

impl AttemptError {
    fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Status { status, .. } | AttemptError::InvalidBody { status, .. } => {
                Some(*status)
            }
            AttemptError::Transport(_) => None,
        }
    }

    fn message(&self) -> String {
        match self {
            AttemptError::Status { status, .. } => format!("HTTP status {}", status),
            AttemptError::Transport(e) => e.to_string(),
            AttemptError::InvalidBody { reason, .. } => format!("invalid response body: {}", reason),
        }
    }
}

impl RetryableError for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Status { status, .. } => {
                classify_status(*status) == StatusClass::Retryable
            }
            AttemptError::Transport(e) => e.is_retryable(),
            AttemptError::InvalidBody { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

struct Channel {
    circuit: CircuitBreaker,
    limiter: RateLimiter,
}

/// HTTP client with per-channel rate limiting and circuit breaking.
pub struct ResilientFetcher {
    transport: Box<dyn HttpTransport>,
    channels: HashMap<String, Channel>,
    config: StashConfig,
    api_key: Option<String>,
    network_calls: u64,
}

impl ResilientFetcher {
    pub fn new(config: &StashConfig, transport: Box<dyn HttpTransport>) -> Self {
        Self {
            transport,
            channels: HashMap::new(),
            config: config.clone(),
            api_key: config.resolve_api_key(),
            network_calls: 0,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Total transport calls made by this fetcher.
    pub fn network_calls(&self) -> u64 {
        self.network_calls
    }

    /// Breaker state for `channel`. Channels never used are closed.
    pub fn circuit_state(&self, channel: &str) -> CircuitState {
        self.channels
            .get(channel)
            .map(|c| c.circuit.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_circuit_open(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .map(|c| c.circuit.is_open())
            .unwrap_or(false)
    }

    pub fn reset_circuits(&self) {
        for channel in self.channels.values() {
            channel.circuit.reset();
        }
    }

    /// Performs one logical fetch.
    pub fn fetch(&mut self, request: &FetchRequest) -> FetchAttemptResult {
        let interval = self.config.min_interval_for(&request.channel);
        let circuit_config = self.config.circuit.clone();
        let channel = self
            .channels
            .entry(request.channel.clone())
            .or_insert_with(|| Channel {
                circuit: CircuitBreaker::new(circuit_config),
                limiter: RateLimiter::new(interval),
            });

        if !channel.circuit.can_execute() {
            let retry_in = channel.circuit.remaining_pause().unwrap_or_default();
            log::debug!(
                "Skipping '{}': circuit open on channel '{}'",
                request.key,
                request.channel
            );
            return FetchAttemptResult {
                outcome: Err(StashError::CircuitOpen {
                    channel: request.channel.clone(),
                    retry_in_ms: retry_in.as_millis() as u64,
                }),
                attempts_used: 0,
            };
        }

        let http_request = build_request(
            request,
            &self.config.user_agent,
            &self.config.api_key_header,
            self.api_key.as_deref(),
        );
        let transport = &self.transport;
        let mut calls = 0u64;

        let result = with_retry(&self.config.retry, |attempt| {
            channel.limiter.acquire();
            calls += 1;
            log::debug!("GET {} (attempt {})", http_request.url, attempt + 1);

            let response = transport
                .get(&http_request)
                .map_err(AttemptError::Transport)?;
            log::debug!("GET {} -> {}", http_request.url, response.status);

            match classify_status(response.status) {
                StatusClass::Success => match request.content_check.validate(&response.body) {
                    Ok(()) => Ok(response.body),
                    Err(reason) => Err(AttemptError::InvalidBody {
                        status: response.status,
                        reason,
                    }),
                },
                StatusClass::Retryable | StatusClass::Permanent => Err(AttemptError::Status {
                    status: response.status,
                    retry_after: response.retry_after,
                }),
            }
        });
        self.network_calls += calls;

        let attempts_used = result.attempts();
        let outcome = match result {
            RetryResult::Success { value, attempts } => {
                channel.circuit.record_success();
                log::info!(
                    "Fetched '{}' ({} bytes, {} attempt(s))",
                    request.key,
                    value.len(),
                    attempts
                );
                Ok(value)
            }
            RetryResult::Failure { error, attempts } => {
                log::debug!(
                    "Permanent failure for '{}' after {} attempt(s): {}",
                    request.key,
                    attempts,
                    error.message()
                );
                Err(StashError::PermanentTransport {
                    key: request.key.clone(),
                    status: error.status(),
                    message: error.message(),
                    attempts,
                    max_attempts: self.config.retry.attempt_budget(),
                    circuit_open: channel.circuit.is_open(),
                })
            }
            RetryResult::Exhausted {
                last_error,
                attempts,
                backoff,
            } => {
                channel.circuit.record_failure();
                let circuit_open = channel.circuit.is_open();
                log::warn!(
                    "Giving up on '{}' after {} attempts: {}{}",
                    request.key,
                    attempts,
                    last_error.message(),
                    if circuit_open { " (circuit now open)" } else { "" }
                );
                Err(StashError::RetryableTransport {
                    key: request.key.clone(),
                    status: last_error.status(),
                    message: last_error.message(),
                    attempts,
                    max_attempts: self.config.retry.attempt_budget(),
                    backoff_ms: backoff.as_millis() as u64,
                    circuit_open,
                })
            }
        };

        FetchAttemptResult {
            outcome,
            attempts_used,
        }
    }
}

fn build_request(
    request: &FetchRequest,
    user_agent: &str,
    api_key_header: &str,
    api_key: Option<&str>,
) -> HttpRequest {
    let mut http = HttpRequest::get(&request.url).with_header("User-Agent", user_agent);
    if let Some(key) = api_key {
        http = http.with_header(api_key_header, key);
    }
    if let Some(accept) = request.content_check.accept_header() {
        http = http.with_header("Accept", accept);
    }
    http
}
