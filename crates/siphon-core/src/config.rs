//! Engine configuration.
//!
//! Stored as JSON under the [`ENGINE_CONFIG_KEY`] key of the configuration
//! table. Missing fields fall back to their defaults so older stored configs
//! keep loading.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::block::BlockPolicy;
use crate::cache_policy::{default_cache_rules, CachePolicy};
use crate::matcher::MatcherInput;

/// Configuration table key holding the engine config.
pub const ENGINE_CONFIG_KEY: &str = "engine";

/// Default marker header added to cache-served responses.
pub const DEFAULT_CACHE_MARKER_HEADER: &str = "x-siphon-cache";

/// Default promotion coalescing delay.
pub const DEFAULT_PROMOTION_DEBOUNCE_MS: u64 = 2_000;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-method cache rules (`true`, `false` or URL patterns).
    pub cache_rules: BTreeMap<String, MatcherInput>,
    /// Domains blocked in addition to the built-in list.
    pub blocked_domains: Vec<String>,
    /// Delay before a pending promotion batch is flushed.
    pub promotion_debounce_ms: u64,
    /// Header marking a response as served from cache.
    pub cache_marker_header: String,
    /// User-Agent sent on revalidation when the page did not supply one.
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_rules: default_cache_rules(),
            blocked_domains: Vec::new(),
            promotion_debounce_ms: DEFAULT_PROMOTION_DEBOUNCE_MS,
            cache_marker_header: DEFAULT_CACHE_MARKER_HEADER.to_string(),
            user_agent: None,
        }
    }
}

impl EngineConfig {
    /// Builds the cache policy described by `cache_rules`.
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::new(&self.cache_rules)
    }

    /// Builds the block policy (built-in list plus `blocked_domains`).
    pub fn block_policy(&self) -> BlockPolicy {
        BlockPolicy::with_extra(&self.blocked_domains)
    }

    /// Promotion debounce as a duration.
    pub fn promotion_debounce(&self) -> Duration {
        Duration::from_millis(self.promotion_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_cache_get_only() {
        let policy = EngineConfig::default().cache_policy();
        assert!(policy.method_allows("GET", "https://x/"));
        assert!(!policy.method_allows("POST", "https://x/"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_value(json!({"blocked_domains": ["ads.example"]})).unwrap();
        assert_eq!(config.promotion_debounce_ms, DEFAULT_PROMOTION_DEBOUNCE_MS);
        assert_eq!(config.cache_marker_header, DEFAULT_CACHE_MARKER_HEADER);
        assert!(config.block_policy().is_blocked("https://ads.example/pixel"));
    }

    #[test]
    fn cache_rules_accept_loose_values() {
        let config: EngineConfig = serde_json::from_value(json!({
            "cache_rules": {"GET": ["\\.png$"], "POST": true}
        }))
        .unwrap();
        let policy = config.cache_policy();
        assert!(policy.method_allows("GET", "https://x/a.png"));
        assert!(!policy.method_allows("GET", "https://x/a.html"));
        assert!(policy.method_allows("POST", "https://x/anything"));
    }

    #[test]
    fn debounce_duration() {
        let config = EngineConfig {
            promotion_debounce_ms: 150,
            ..EngineConfig::default()
        };
        assert_eq!(config.promotion_debounce(), Duration::from_millis(150));
    }
}
