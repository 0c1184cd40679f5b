//! Metadata persisted alongside every cached body.

use serde::{Deserialize, Serialize};

use crate::cache_policy::Validity;
use crate::headers::Headers;

/// Captured POST payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostBody {
    /// Raw payload as reported by the channel.
    pub data: String,
    /// Value of the request `Content-Type`, if any.
    pub content_type: Option<String>,
}

impl PostBody {
    /// Pairs a payload with the content type found in `headers`.
    pub fn from_request(data: impl Into<String>, headers: &Headers) -> Self {
        Self {
            data: data.into(),
            content_type: headers.get("content-type").map(str::to_string),
        }
    }
}

/// Cache record metadata (`info` column).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Request headers that produced the response.
    pub sent_headers: Headers,
    /// Response headers as stored.
    pub response_headers: Headers,
    /// Response time, unix milliseconds.
    pub date: i64,
    /// Freshness deadline, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<i64>,
    /// Always revalidate before serving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidate: Option<bool>,
    /// Marked `immutable` by the origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable: Option<bool>,
    /// Body was delivered base64 encoded.
    pub body_is_binary: bool,
    /// POST payload, for POST records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_body: Option<PostBody>,
}

impl CacheInfo {
    /// Builds metadata for a response received at `date` (unix ms).
    pub fn new(sent_headers: Headers, response_headers: Headers, date: i64, validity: Validity) -> Self {
        let mut info = Self {
            sent_headers,
            response_headers,
            date,
            valid_until: None,
            revalidate: None,
            immutable: None,
            body_is_binary: false,
            post_body: None,
        };
        info.apply_validity(validity);
        info
    }

    /// Replaces freshness fields with a newly computed validity.
    pub fn apply_validity(&mut self, validity: Validity) {
        self.valid_until = validity.valid_until;
        self.revalidate = validity.revalidate;
        self.immutable = validity.immutable;
    }

    /// True when the entry must be confirmed with the origin before use.
    ///
    /// Records with neither a deadline nor an explicit flag are treated as
    /// always-revalidate.
    pub fn needs_revalidation(&self, now_ms: i64) -> bool {
        if self.revalidate == Some(true) {
            return true;
        }
        match self.valid_until {
            Some(deadline) => deadline < now_ms,
            None => self.revalidate.is_none(),
        }
    }
}
