//! HTTP boundary.
//!
//! [`HttpTransport`] performs exactly one GET and reports what came back. It
//! does not retry, rate-limit or judge the body; that is the fetcher's job.
//! Every status, 4xx and 5xx included, comes back as an [`HttpResponse`]; only
//! failures where no response was received are errors.

use chrono::{DateTime, Utc};
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

use crate::config::StashConfig;

/// One outbound GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Parsed `Retry-After`, if the server sent one.
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: None,
            retry_after: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Failures where no HTTP response was obtained.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },
}

impl TransportError {
    /// Network-level failures are transient; malformed requests and oversized
    /// bodies will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout(_)
            | TransportError::Dns(_)
            | TransportError::Connection(_)
            | TransportError::Io(_) => true,
            TransportError::InvalidRequest(_) | TransportError::BodyTooLarge { .. } => false,
        }
    }
}

/// Performs one HTTP GET.
pub trait HttpTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking transport over a shared `ureq` agent.
///
/// TLS certificates are verified against the bundled webpki roots.
pub struct UreqTransport {
    agent: ureq::Agent,
    max_body_bytes: u64,
}

impl UreqTransport {
    pub fn new(config: &StashConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(&config.user_agent)
            .build();

        log::debug!(
            "UreqTransport created (connect timeout {}ms, request timeout {}ms)",
            config.connect_timeout_ms,
            config.request_timeout_ms
        );

        Self {
            agent,
            max_body_bytes: config.max_body_bytes,
        }
    }

    fn read_response(&self, response: ureq::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status();
        let content_type = response.header("Content-Type").map(str::to_string);
        let retry_after = response
            .header("Retry-After")
            .and_then(|v| parse_retry_after(v, Utc::now()));

        let mut body = Vec::new();
        response
            .into_reader()
            .take(self.max_body_bytes.saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|e| classify_io(&e))?;

        if body.len() as u64 > self.max_body_bytes {
            return Err(TransportError::BodyTooLarge {
                limit: self.max_body_bytes,
            });
        }

        Ok(HttpResponse {
            status,
            body,
            content_type,
            retry_after,
        })
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut call = self.agent.get(&request.url);
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }

        match call.call() {
            Ok(response) => self.read_response(response),
            Err(ureq::Error::Status(_, response)) => self.read_response(response),
            Err(ureq::Error::Transport(transport)) => Err(classify_transport(&transport)),
        }
    }
}

fn classify_transport(transport: &ureq::Transport) -> TransportError {
    let detail = transport.to_string();
    match transport.kind() {
        ureq::ErrorKind::Dns => TransportError::Dns(detail),
        ureq::ErrorKind::ConnectionFailed
        | ureq::ErrorKind::ProxyConnect
        | ureq::ErrorKind::TooManyRedirects => TransportError::Connection(detail),
        ureq::ErrorKind::Io if is_timeout_message(&detail) => TransportError::Timeout(detail),
        ureq::ErrorKind::Io | ureq::ErrorKind::BadStatus | ureq::ErrorKind::BadHeader => {
            TransportError::Io(detail)
        }
        ureq::ErrorKind::InvalidUrl
        | ureq::ErrorKind::UnknownScheme
        | ureq::ErrorKind::InsecureRequestHttpsOnly
        | ureq::ErrorKind::InvalidProxyUrl
        | ureq::ErrorKind::ProxyUnauthorized => TransportError::InvalidRequest(detail),
        _ => TransportError::Io(detail),
    }
}

fn classify_io(error: &std::io::Error) -> TransportError {
    match error.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportError::Timeout(error.to_string())
        }
        _ if is_timeout_message(&error.to_string()) => TransportError::Timeout(error.to_string()),
        _ => TransportError::Io(error.to_string()),
    }
}

fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc).signed_duration_since(now);
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_transport_error_retryability() {
        assert!(TransportError::Timeout("t".into()).is_retryable());
        assert!(TransportError::Dns("d".into()).is_retryable());
        assert!(TransportError::Connection("refused".into()).is_retryable());
        assert!(!TransportError::InvalidRequest("bad url".into()).is_retryable());
        assert!(!TransportError::BodyTooLarge { limit: 10 }.is_retryable());
    }

    #[test]
    fn test_request_headers_case_insensitive() {
        let request = HttpRequest::get("https://example.org/r/1").with_header("User-Agent", "x/1");
        assert_eq!(request.header("user-agent"), Some("x/1"));
        assert_eq!(request.header("accept"), None);
    }

    #[test]
    fn test_invalid_url_is_permanent() {
        let transport = UreqTransport::new(&StashConfig::new("/tmp/unused"));
        let err = transport.get(&HttpRequest::get("not a url")).unwrap_err();
        assert!(!err.is_retryable(), "unexpected: {:?}", err);
    }

    #[test]
    fn test_classify_io_timeout() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "read");
        assert!(matches!(classify_io(&err), TransportError::Timeout(_)));
    }
}
