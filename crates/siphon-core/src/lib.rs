//! Siphon Core - rule matching, cache policy and header handling.
//!
//! Pure logic shared by the storage and interception crates. Nothing in here
//! performs I/O.
//!
//! - [`matcher`]: `All | None | Patterns` matchers and input normalization
//! - [`rules`]: per-consumer rule sets and header visibility
//! - [`cache_policy`]: cacheability and freshness decisions
//! - [`block`]: analytics/tracking block list
//! - [`headers`], [`body`], [`record`]: data carried through the engine
//! - [`config`]: engine configuration

pub mod block;
pub mod body;
pub mod cache_policy;
pub mod config;
pub mod error;
pub mod headers;
pub mod matcher;
pub mod record;
pub mod rules;

pub use block::{BlockPolicy, BLOCKED_DOMAINS};
pub use body::Body;
pub use cache_policy::{
    compute_validity, format_http_date, parse_http_date, validity_from_headers, CachePolicy,
    Validity,
};
pub use config::{EngineConfig, ENGINE_CONFIG_KEY};
pub use error::{CoreError, Result};
pub use headers::{extension_from_headers, Header, Headers};
pub use matcher::{normalize, Matcher, MatcherInput, Pattern};
pub use record::{CacheInfo, PostBody};
pub use rules::{headers_visible_to, RuleRegistry, RuleSet, RuleSetSpec};

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
