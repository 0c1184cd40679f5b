//! Named rule sets describing what each consumer wants to observe.
//!
//! Every consumer (a site parser, a traffic counter, ...) registers one rule
//! set under its own marker. Registering again with the same marker replaces
//! the earlier set. Event fan-out is the union over all registered sets: each
//! set whose matcher accepts a URL receives its own copy of the event, with
//! headers filtered by that set's header filters only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::headers::Headers;
use crate::matcher::{normalize, Matcher, MatcherInput};

/// Rule set as supplied by a consumer, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSetSpec {
    /// Unique consumer identifier.
    pub marker: String,
    /// URLs whose requests the consumer wants to see.
    pub request: MatcherInput,
    /// URLs whose responses the consumer wants to see.
    pub response: MatcherInput,
    /// Request header names the consumer may see.
    pub request_headers: MatcherInput,
    /// Response header names the consumer may see.
    pub response_headers: MatcherInput,
}

impl RuleSetSpec {
    /// Creates an empty spec (matches nothing) for a marker.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            ..Self::default()
        }
    }

    /// Sets the request URL matcher.
    pub fn requests(mut self, input: impl Into<MatcherInput>) -> Self {
        self.request = input.into();
        self
    }

    /// Sets the response URL matcher.
    pub fn responses(mut self, input: impl Into<MatcherInput>) -> Self {
        self.response = input.into();
        self
    }

    /// Sets the visible request headers.
    pub fn request_headers(mut self, input: impl Into<MatcherInput>) -> Self {
        self.request_headers = input.into();
        self
    }

    /// Sets the visible response headers.
    pub fn response_headers(mut self, input: impl Into<MatcherInput>) -> Self {
        self.response_headers = input.into();
        self
    }
}

/// A normalized rule set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// Unique consumer identifier.
    pub marker: String,
    /// Request URL matcher.
    pub request_match: Matcher,
    /// Response URL matcher.
    pub response_match: Matcher,
    /// Visible request header names.
    pub request_header_filter: Matcher,
    /// Visible response header names.
    pub response_header_filter: Matcher,
}

impl RuleSet {
    /// Normalizes a spec. URL matchers compile as regexes, header filters are
    /// lowercased literals.
    pub fn from_spec(spec: &RuleSetSpec) -> Result<Self> {
        if spec.marker.trim().is_empty() {
            return Err(CoreError::EmptyMarker);
        }

        Ok(Self {
            marker: spec.marker.clone(),
            request_match: normalize(&spec.request, true, false),
            response_match: normalize(&spec.response, true, false),
            request_header_filter: normalize(&spec.request_headers, false, true),
            response_header_filter: normalize(&spec.response_headers, false, true),
        })
    }
}

/// Registry of rule sets keyed by marker.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    sets: Vec<RuleSet>,
}

impl RuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes and registers a spec. Returns true if an existing set with
    /// the same marker was replaced.
    pub fn add_rule_set(&mut self, spec: &RuleSetSpec) -> Result<bool> {
        let set = RuleSet::from_spec(spec)?;
        Ok(self.register(set))
    }

    /// Upserts a rule set by marker. Returns true if it replaced another one.
    pub fn register(&mut self, set: RuleSet) -> bool {
        match self.sets.iter_mut().find(|s| s.marker == set.marker) {
            Some(existing) => {
                tracing::debug!("Replacing rule set {}", set.marker);
                *existing = set;
                true
            }
            None => {
                tracing::debug!("Registering rule set {}", set.marker);
                self.sets.push(set);
                false
            }
        }
    }

    /// Removes a rule set. Returns true if one was present.
    pub fn remove(&mut self, marker: &str) -> bool {
        let before = self.sets.len();
        self.sets.retain(|s| s.marker != marker);
        before != self.sets.len()
    }

    /// Looks up a rule set by marker.
    pub fn get(&self, marker: &str) -> Option<&RuleSet> {
        self.sets.iter().find(|s| s.marker == marker)
    }

    /// Number of registered sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Sets interested in the request for `url`.
    pub fn request_subscribers<'a>(&'a self, url: &'a str) -> impl Iterator<Item = &'a RuleSet> {
        self.sets.iter().filter(move |s| s.request_match.accepts(url))
    }

    /// Sets interested in the response for `url`.
    pub fn response_subscribers<'a>(&'a self, url: &'a str) -> impl Iterator<Item = &'a RuleSet> {
        self.sets.iter().filter(move |s| s.response_match.accepts(url))
    }
}

/// Header map restricted to the names a matcher accepts.
///
/// `None` yields an empty map, `All` the full (lowercased) map.
pub fn headers_visible_to(headers: &Headers, matcher: &Matcher) -> BTreeMap<String, String> {
    match matcher {
        Matcher::None => BTreeMap::new(),
        Matcher::All => headers.to_map(),
        patterns => headers
            .to_map()
            .into_iter()
            .filter(|(name, _)| patterns.accepts(name))
            .collect(),
    }
}
