//! Static block list for analytics and tracking hosts.
//!
//! Requests to these hosts never reach the network: the dispatcher fails them
//! before any other processing.

use url::Url;

/// Analytics and tracking domains blocked by default.
pub const BLOCKED_DOMAINS: &[&str] = &[
    // Google
    "googletagmanager.com",
    "google-analytics.com",
    "googlesyndication.com",
    "googleadservices.com",
    "doubleclick.net",
    // Other trackers
    "scorecardresearch.com",
    "quantserve.com",
    "hotjar.com",
    "mc.yandex.ru",
    "connect.facebook.net",
    "adservice.google.com",
];

/// Host-based block policy.
#[derive(Debug, Clone)]
pub struct BlockPolicy {
    domains: Vec<String>,
}

impl BlockPolicy {
    /// Built-in list plus `extra` domains.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains: Vec<String> = BLOCKED_DOMAINS.iter().map(|d| d.to_string()).collect();
        for domain in extra {
            let domain = domain.as_ref().trim().trim_start_matches('.').to_ascii_lowercase();
            if !domain.is_empty() && !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        Self { domains }
    }

    /// A policy that blocks nothing.
    pub fn empty() -> Self {
        Self {
            domains: Vec::new(),
        }
    }

    /// True when the URL's host is a blocked domain or one of its subdomains.
    ///
    /// URLs without a parseable host are never blocked.
    pub fn is_blocked(&self, url: &str) -> bool {
        let host = match Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(h) => h.to_ascii_lowercase(),
                None => return false,
            },
            Err(_) => return false,
        };

        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self::with_extra(std::iter::empty::<&str>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_known_trackers() {
        let policy = BlockPolicy::default();
        assert!(policy.is_blocked("https://googletagmanager.com/gtm.js?id=1"));
        assert!(policy.is_blocked("https://www.googletagmanager.com/gtm.js"));
        assert!(policy.is_blocked("https://stats.g.doubleclick.net/collect"));
    }

    #[test]
    fn does_not_block_lookalikes() {
        let policy = BlockPolicy::default();
        assert!(!policy.is_blocked("https://notgoogletagmanager.com/"));
        assert!(!policy.is_blocked("https://example.com/googletagmanager.com"));
        assert!(!policy.is_blocked("not a url"));
        assert!(!policy.is_blocked("data:text/plain,hello"));
    }

    #[test]
    fn extra_domains_are_normalized() {
        let policy = BlockPolicy::with_extra([" .Tracker.Example ", ""]);
        assert!(policy.is_blocked("https://a.tracker.example/x"));
        assert!(policy.is_blocked("https://googletagmanager.com/"));
    }

    #[test]
    fn empty_policy_blocks_nothing() {
        assert!(!BlockPolicy::empty().is_blocked("https://googletagmanager.com/"));
    }
}
