//! Cacheability decisions and freshness computation.
//!
//! Only the core `Cache-Control` and `Expires` directives are honored; `Vary`
//! and partial content are out of scope.
//!
//! ## Freshness precedence
//!
//! 1. `no-store` or a non-positive `max-age` / `s-maxage`: do not cache.
//! 2. `s-maxage=N` sets the deadline and disables the `Expires` fallback.
//! 3. otherwise `max-age=N` sets the deadline.
//! 4. with no deadline yet, a valid future `Expires` date becomes the deadline.
//! 5. `no-cache` / `must-revalidate` force revalidation; `immutable` clears it.
//! 6. an entry left with neither deadline nor flag always revalidates.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::headers::Headers;
use crate::matcher::{normalize, Matcher, MatcherInput};

/// Result of freshness computation for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Validity {
    /// Freshness deadline, unix milliseconds.
    pub valid_until: Option<i64>,
    /// Revalidate before serving.
    pub revalidate: Option<bool>,
    /// Marked immutable by the origin.
    pub immutable: Option<bool>,
}

/// Computes freshness from `Cache-Control` and `Expires` values.
///
/// Returns `None` when the response must not be cached at all.
pub fn compute_validity(
    cache_control: Option<&str>,
    expires: Option<&str>,
    now: DateTime<Utc>,
) -> Option<Validity> {
    let now_ms = now.timestamp_millis();
    let mut max_age = None;
    let mut s_maxage = None;
    let mut must_revalidate = false;
    let mut immutable = false;

    for token in cache_control
        .unwrap_or("")
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
    {
        match token.as_str() {
            "no-store" => return None,
            "no-cache" | "must-revalidate" => must_revalidate = true,
            "immutable" => immutable = true,
            t => {
                let (slot, value) = if let Some(value) = t.strip_prefix("max-age=") {
                    (&mut max_age, value)
                } else if let Some(value) = t.strip_prefix("s-maxage=") {
                    (&mut s_maxage, value)
                } else {
                    continue;
                };
                match parse_seconds(value) {
                    Some(secs) if secs > 0 => *slot = Some(secs),
                    Some(_) => return None,
                    None => {}
                }
            }
        }
    }

    let mut validity = Validity {
        valid_until: s_maxage.or(max_age).map(|secs| {
            secs.checked_mul(1000)
                .and_then(|delta| now_ms.checked_add(delta))
                .unwrap_or(i64::MAX)
        }),
        ..Validity::default()
    };

    if validity.valid_until.is_none() && s_maxage.is_none() {
        validity.valid_until = expires
            .and_then(parse_http_date)
            .map(|d| d.timestamp_millis())
            .filter(|ms| *ms > now_ms);
    }

    if must_revalidate {
        validity.revalidate = Some(true);
    }
    if immutable {
        validity.revalidate = Some(false);
        validity.immutable = Some(true);
    }
    if validity.valid_until.is_none() && validity.revalidate.is_none() {
        validity.revalidate = Some(true);
    }

    Some(validity)
}

/// Convenience wrapper reading both directives from a header bag.
pub fn validity_from_headers(headers: &Headers, now: DateTime<Utc>) -> Option<Validity> {
    compute_validity(headers.get("cache-control"), headers.get("expires"), now)
}

/// Parses a delta-seconds value; malformed values are logged and ignored.
fn parse_seconds(value: &str) -> Option<i64> {
    let value = value.trim_matches('"');
    match value.parse::<i64>() {
        Ok(secs) => Some(secs),
        // Ages too large for i64 saturate instead of being ignored.
        Err(_) if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => Some(i64::MAX),
        Err(e) => {
            tracing::warn!("Unparseable cache-control age {:?}: {}", value, e);
            None
        }
    }
}

/// Parses an HTTP date (IMF-fixdate, RFC 850 or asctime).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Formats a timestamp as an IMF-fixdate.
pub fn format_http_date(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Default per-method cache rules: every GET, no POST.
pub fn default_cache_rules() -> BTreeMap<String, MatcherInput> {
    BTreeMap::from([
        ("GET".to_string(), MatcherInput::all()),
        ("POST".to_string(), MatcherInput::none()),
    ])
}

/// Per-method cacheability policy.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    methods: BTreeMap<String, Matcher>,
}

impl CachePolicy {
    /// Builds a policy from per-method matcher input. Methods are uppercased.
    pub fn new(rules: &BTreeMap<String, MatcherInput>) -> Self {
        let methods = rules
            .iter()
            .map(|(method, input)| (method.to_ascii_uppercase(), normalize(input, true, false)))
            .collect();
        Self { methods }
    }

    /// True when the method has a policy accepting `url`.
    pub fn method_allows(&self, method: &str, url: &str) -> bool {
        self.methods
            .get(&method.to_ascii_uppercase())
            .is_some_and(|m| m.accepts(url))
    }

    /// Decides whether a response may be stored.
    ///
    /// `no-store`, `Authorization` or `Set-Cookie` disqualify unconditionally.
    pub fn should_cache(&self, method: &str, url: &str, response_headers: &Headers) -> bool {
        if !self.method_allows(method, url) {
            return false;
        }
        if response_headers
            .tokens("cache-control")
            .iter()
            .any(|t| t == "no-store")
        {
            return false;
        }
        !(response_headers.contains("authorization") || response_headers.contains("set-cookie"))
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(&default_cache_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn ms(dt: DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    #[test]
    fn huge_max_age_saturates() {
        let v = compute_validity(Some("max-age=9223372036854775807"), None, now()).unwrap();
        assert_eq!(v.valid_until, Some(i64::MAX));

        let v = compute_validity(Some("s-maxage=99999999999999999999999"), None, now()).unwrap();
        assert_eq!(v.valid_until, Some(i64::MAX));
        assert_eq!(v.revalidate, None);
    }

    #[test]
    fn max_age_sets_deadline() {
        let v = compute_validity(Some("max-age=3600"), None, now()).unwrap();
        assert_eq!(v.valid_until, Some(ms(now()) + 3_600_000));
        assert_eq!(v.revalidate, None);
        assert_eq!(v.immutable, None);
    }

    #[test]
    fn s_maxage_overrides_max_age() {
        let v = compute_validity(Some("s-maxage=10, max-age=3600"), None, now()).unwrap();
        assert_eq!(v.valid_until, Some(ms(now()) + 10_000));
    }

    #[test]
    fn expires_fallback_when_no_age() {
        let expires = format_http_date(now() + Duration::hours(2));
        let v = compute_validity(Some("public"), Some(&expires), now()).unwrap();
        assert_eq!(v.valid_until, Some(ms(now() + Duration::hours(2))));
        assert_eq!(v.revalidate, None);
    }

    #[test]
    fn expires_ignored_when_max_age_present() {
        let expires = format_http_date(now() + Duration::hours(2));
        let v = compute_validity(Some("max-age=60"), Some(&expires), now()).unwrap();
        assert_eq!(v.valid_until, Some(ms(now()) + 60_000));
    }

    #[test]
    fn s_maxage_suppresses_expires() {
        let expires = format_http_date(now() + Duration::hours(2));
        let v = compute_validity(Some("s-maxage=5"), Some(&expires), now()).unwrap();
        assert_eq!(v.valid_until, Some(ms(now()) + 5_000));
    }

    #[test]
    fn past_or_invalid_expires_means_revalidate() {
        let past = format_http_date(now() - Duration::hours(1));
        for expires in [Some(past.as_str()), Some("0"), Some("not a date"), None] {
            let v = compute_validity(None, expires, now()).unwrap();
            assert_eq!(v.valid_until, None);
            assert_eq!(v.revalidate, Some(true), "expires {:?}", expires);
        }
    }

    #[test]
    fn no_cache_and_must_revalidate_flag() {
        for cc in ["no-cache", "max-age=60, must-revalidate"] {
            let v = compute_validity(Some(cc), None, now()).unwrap();
            assert_eq!(v.revalidate, Some(true));
        }
    }

    #[test]
    fn immutable_clears_revalidate() {
        let v = compute_validity(Some("no-cache, immutable"), None, now()).unwrap();
        assert_eq!(v.revalidate, Some(false));
        assert_eq!(v.immutable, Some(true));
        assert_eq!(v.valid_until, None);
    }

    #[test]
    fn non_positive_age_cancels() {
        assert!(compute_validity(Some("max-age=0"), None, now()).is_none());
        assert!(compute_validity(Some("s-maxage=-5"), None, now()).is_none());
        assert!(compute_validity(Some("no-store"), None, now()).is_none());
    }

    #[test]
    fn malformed_age_is_ignored() {
        let v = compute_validity(Some("max-age=soon"), None, now()).unwrap();
        assert_eq!(v.valid_until, None);
        assert_eq!(v.revalidate, Some(true));
    }

    #[test]
    fn quoted_and_cased_values() {
        let v = compute_validity(Some("Max-Age=\"30\""), None, now()).unwrap();
        assert_eq!(v.valid_until, Some(ms(now()) + 30_000));
    }

    #[test]
    fn http_date_formats() {
        let expected = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(expected));
        assert_eq!(parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"), Some(expected));
        assert_eq!(format_http_date(expected), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn policy_defaults() {
        let policy = CachePolicy::default();
        let headers = Headers::new();
        assert!(policy.should_cache("GET", "https://x/y.png", &headers));
        assert!(policy.should_cache("get", "https://x/y.png", &headers));
        assert!(!policy.should_cache("POST", "https://x/api", &headers));
        assert!(!policy.should_cache("PUT", "https://x/api", &headers));
    }

    #[test]
    fn policy_disqualifiers() {
        let policy = CachePolicy::default();
        for (name, value) in [
            ("Cache-Control", "public, no-store"),
            ("Set-Cookie", "id=1"),
            ("Authorization", "Bearer x"),
        ] {
            let headers: Headers = [(name, value)].into_iter().collect();
            assert!(!policy.should_cache("GET", "https://x/y", &headers), "{}", name);
        }
    }

    #[test]
    fn policy_patterns() {
        let rules = BTreeMap::from([
            ("get".to_string(), MatcherInput::list(["\\.png$"])),
            ("POST".to_string(), MatcherInput::list(["/graphql"])),
        ]);
        let policy = CachePolicy::new(&rules);
        assert!(policy.method_allows("GET", "https://x/a.png"));
        assert!(!policy.method_allows("GET", "https://x/a.jpg"));
        assert!(policy.method_allows("POST", "https://x/graphql"));
    }
}
