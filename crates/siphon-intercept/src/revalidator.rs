//! Out-of-band conditional revalidation of stale cache records.
//!
//! Requests go straight to the network with the revalidator's own client;
//! the instrumented surface never sees them.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use siphon_core::{format_http_date, Headers};
use siphon_storage::CacheRecord;

use crate::decode::decode_content;
use crate::error::{InterceptError, Result};

/// Encodings requested on every revalidation.
pub const ACCEPT_ENCODING: &str = "gzip, deflate, br";

/// Outcome of a revalidation attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// False on any failure to get an answer from the origin.
    pub accepted: bool,
    pub status_code: Option<u16>,
    pub response_headers: Option<Headers>,
    /// Decoded body, when the origin sent one.
    pub body: Option<Vec<u8>>,
}

impl ValidationResult {
    /// No usable answer.
    pub fn rejected() -> Self {
        Self::default()
    }
}

/// Confirms or refreshes a cache record with its origin.
///
/// Implementations never fail; problems resolve to `accepted = false`.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn revalidate(
        &self,
        method: &str,
        record: &CacheRecord,
        request_headers: &Headers,
    ) -> ValidationResult;
}

/// Builds the conditional request headers for `record`.
pub fn conditional_headers(
    record: &CacheRecord,
    request_headers: &Headers,
    fallback_user_agent: Option<&str>,
) -> Headers {
    let mut headers = Headers::new();

    match request_headers.get("if-modified-since") {
        Some(value) => headers.push("If-Modified-Since", value),
        None => {
            if let Some(date) = Utc.timestamp_millis_opt(record.info.date).single() {
                headers.push("If-Modified-Since", format_http_date(date));
            }
        }
    }

    if let Some(etag) = record.info.response_headers.get("etag") {
        headers.push("If-None-Match", etag);
    }

    if let Some(ua) = request_headers.get("user-agent").or(fallback_user_agent) {
        headers.push("User-Agent", ua);
    }

    headers.push("Accept-Encoding", ACCEPT_ENCODING);
    headers
}

/// Network revalidator backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct Revalidator {
    client: reqwest::Client,
    user_agent: Option<String>,
}

impl Revalidator {
    /// Creates a revalidator with a default client.
    pub fn new(user_agent: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, user_agent))
    }

    /// Creates a revalidator around an existing client.
    pub fn with_client(client: reqwest::Client, user_agent: Option<String>) -> Self {
        Self { client, user_agent }
    }

    async fn fetch(&self, url: &str, headers: &Headers) -> Result<ValidationResult> {
        let mut request = self.client.get(url);
        for header in headers {
            request = request.header(header.name.as_str(), header.value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        let mut response_headers = Headers::new();
        for (name, value) in response.headers() {
            response_headers.push(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }

        let raw = response.bytes().await?;
        let body = match response_headers.get("content-encoding").map(str::to_string) {
            Some(encoding) if !raw.is_empty() => match decode_content(&encoding, &raw) {
                Ok(Some(decoded)) => {
                    // Framing headers describe the encoded payload.
                    response_headers = response_headers.without(&[
                        "content-encoding",
                        "content-length",
                        "transfer-encoding",
                    ]);
                    decoded
                }
                Ok(None) => raw.to_vec(),
                Err(e) => {
                    return Err(InterceptError::Parse(format!(
                        "{} body of {} does not decode: {}",
                        encoding, url, e
                    )))
                }
            },
            _ => raw.to_vec(),
        };

        Ok(ValidationResult {
            accepted: true,
            status_code: Some(status),
            response_headers: Some(response_headers),
            body: (!body.is_empty()).then_some(body),
        })
    }
}

#[async_trait]
impl Validator for Revalidator {
    async fn revalidate(
        &self,
        method: &str,
        record: &CacheRecord,
        request_headers: &Headers,
    ) -> ValidationResult {
        if !method.eq_ignore_ascii_case("GET") {
            return ValidationResult::rejected();
        }

        let headers = conditional_headers(record, request_headers, self.user_agent.as_deref());
        match self.fetch(&record.url, &headers).await {
            Ok(result) => {
                tracing::debug!(
                    "Revalidated {} -> {:?}",
                    record.url,
                    result.status_code
                );
                result
            }
            Err(e) => {
                tracing::debug!("Revalidation of {} failed ({}): {}", record.url, e.kind(), e);
                ValidationResult::rejected()
            }
        }
    }
}
