//! Ordered header bag.
//!
//! The instrumentation channel reports headers either as name/value pair
//! lists or as maps depending on the stage. Internally everything is kept as
//! an ordered list of pairs; lookups are case-insensitive. A lowercased map
//! view is only produced for rule-set filtering (see [`crate::rules`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single header entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name as received.
    pub name: String,
    /// Header value.
    pub value: String,
}

impl Header {
    /// Creates a header entry.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered list of headers with case-insensitive access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header bag.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the first value for `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Returns true if at least one header named `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a header, keeping any existing entries with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Replaces every entry named `name` with a single new value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push(Header::new(name, value));
    }

    /// Removes every entry named `name`. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Returns a copy without the named headers.
    pub fn without(&self, names: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|h| !names.iter().any(|n| h.name.eq_ignore_ascii_case(n)))
                .cloned()
                .collect(),
        )
    }

    /// Iterates over entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercased map view, keeping the first value seen for each name.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for header in &self.0 {
            map.entry(header.name.to_ascii_lowercase())
                .or_insert_with(|| header.value.clone());
        }
        map
    }

    /// Lowercased tokens of a comma separated header such as `Cache-Control`.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Self(headers)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| Header::new(k, v)).collect())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Guesses a file extension (with leading dot) from `Content-Type`.
///
/// Falls back to an empty string when the type is missing or unknown.
pub fn extension_from_headers(headers: &Headers) -> &'static str {
    let content_type = match headers.get("content-type") {
        Some(v) => v.split(';').next().unwrap_or("").trim().to_ascii_lowercase(),
        None => return "",
    };

    match content_type.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/avif" => ".avif",
        "image/bmp" => ".bmp",
        "image/svg+xml" => ".svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        "text/html" => ".html",
        "text/css" => ".css",
        "text/plain" => ".txt",
        "application/javascript" | "text/javascript" => ".js",
        "application/json" => ".json",
        "font/woff" => ".woff",
        "font/woff2" => ".woff2",
        _ => "",
    }
}
