//! Key resolution - turns a logical key into a [`FetchRequest`].
//!
//! Upstream code asks for keys ("record 1234"); the resolver decides where
//! that key lives, which channel it is fetched on, and how long it stays fresh.

use url::Url;

use crate::error::{StashError, StashResult};
use crate::fetcher::{ContentCheck, FetchRequest, DEFAULT_CHANNEL, DEFAULT_FILE_NAME};
use crate::manifest::TtlClass;

/// Maps a key to the request that fetches it.
pub trait RequestResolver {
    fn resolve(&self, key: &str) -> StashResult<FetchRequest>;
}

impl<F> RequestResolver for F
where
    F: Fn(&str) -> StashResult<FetchRequest>,
{
    fn resolve(&self, key: &str) -> StashResult<FetchRequest> {
        self(key)
    }
}

/// Resolver that substitutes the key into a URL template.
///
/// Every `{key}` in the template is replaced with the percent-encoded key and
/// the result must parse as an absolute URL.
///
/// ```rust
/// use docstash::{RequestResolver, TtlClass, UrlTemplate};
///
/// let records = UrlTemplate::new("https://data.example.org/records/{key}.json")
///     .with_channel("records")
///     .with_ttl_class(TtlClass::SafetyCritical);
///
/// let request = records.resolve("A 12/3").unwrap();
/// assert_eq!(request.url, "https://data.example.org/records/A%2012%2F3.json");
/// assert_eq!(request.channel, "records");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    template: String,
    channel: String,
    ttl_class: TtlClass,
    content_check: ContentCheck,
    file_name: String,
    expected_size: Option<u64>,
}

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
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

    pub fn url_for(&self, key: &str) -> StashResult<Url> {
        let raw = self.template.replace("{key}", &urlencoding::encode(key));
        Url::parse(&raw).map_err(|e| {
            StashError::Config(format!(
                "template '{}' gives invalid URL for '{}': {}",
                self.template, key, e
            ))
        })
    }
}

impl RequestResolver for UrlTemplate {
    fn resolve(&self, key: &str) -> StashResult<FetchRequest> {
        let mut request = FetchRequest::new(key, self.url_for(key)?)
            .with_channel(self.channel.clone())
            .with_ttl_class(self.ttl_class)
            .with_content_check(self.content_check.clone())
            .with_file_name(self.file_name.clone());
        request.expected_size = self.expected_size;
        Ok(request)
    }
}
