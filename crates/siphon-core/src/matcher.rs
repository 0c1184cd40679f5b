//! Matchers: "everything", "nothing" or "these patterns".
//!
//! Rule producers describe what they want to see with loosely shaped input:
//! `true`, `false`, a list of pattern strings, or already compiled regexes.
//! [`normalize`] turns any of those into a [`Matcher`] once, at registration
//! time, so that the hot path only ever deals with the tagged form.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Loosely shaped matcher description as supplied by a rule producer.
#[derive(Debug, Clone, Default)]
pub enum MatcherInput {
    /// `true` matches everything, `false` matches nothing.
    Flag(bool),
    /// Pattern sources (regex sources or literal names).
    List(Vec<String>),
    /// Pre-compiled regexes.
    Compiled(Vec<Regex>),
    /// Anything else; treated as "match nothing".
    #[default]
    Unset,
}

impl MatcherInput {
    /// Matches every subject.
    pub fn all() -> Self {
        MatcherInput::Flag(true)
    }

    /// Matches no subject.
    pub fn none() -> Self {
        MatcherInput::Flag(false)
    }

    /// Builds a list input from string-like items.
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MatcherInput::List(items.into_iter().map(Into::into).collect())
    }

    /// Interprets a JSON value. Non-string list entries are dropped.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(flag) => MatcherInput::Flag(*flag),
            Value::Array(items) => MatcherInput::List(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => MatcherInput::Unset,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            MatcherInput::Flag(flag) => Value::Bool(*flag),
            MatcherInput::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            MatcherInput::Compiled(items) => Value::Array(
                items
                    .iter()
                    .map(|r| Value::String(r.as_str().to_string()))
                    .collect(),
            ),
            MatcherInput::Unset => Value::Null,
        }
    }
}

impl From<bool> for MatcherInput {
    fn from(flag: bool) -> Self {
        MatcherInput::Flag(flag)
    }
}

impl From<Vec<Regex>> for MatcherInput {
    fn from(patterns: Vec<Regex>) -> Self {
        MatcherInput::Compiled(patterns)
    }
}

impl<'de> Deserialize<'de> for MatcherInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(MatcherInput::from_json(&value))
    }
}

impl Serialize for MatcherInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One entry of a [`Matcher::Patterns`] list.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Unanchored regex search.
    Regex(Regex),
    /// Case-insensitive exact comparison.
    Literal(String),
}

impl Pattern {
    fn matches(&self, subject: &str) -> bool {
        match self {
            Pattern::Regex(re) => re.is_match(subject),
            Pattern::Literal(lit) => lit.eq_ignore_ascii_case(subject),
        }
    }
}

/// Normalized matcher.
#[derive(Debug, Clone, Default)]
pub enum Matcher {
    /// Accepts every subject.
    All,
    /// Accepts nothing.
    #[default]
    None,
    /// Accepts a subject if any pattern does.
    Patterns(Vec<Pattern>),
}

impl Matcher {
    /// Tests a subject (a URL or a header name).
    pub fn accepts(&self, subject: &str) -> bool {
        match self {
            Matcher::All => true,
            Matcher::None => false,
            Matcher::Patterns(patterns) => patterns.iter().any(|p| p.matches(subject)),
        }
    }

    /// Returns true for [`Matcher::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Matcher::None)
    }
}

/// Normalizes a loosely shaped input into a [`Matcher`].
///
/// `as_pattern` compiles list entries as regexes, otherwise they are kept as
/// literals. `case_fold` lowercases list entries first. Empty strings and
/// regexes that fail to compile are dropped; a list left empty becomes
/// [`Matcher::None`].
pub fn normalize(input: &MatcherInput, as_pattern: bool, case_fold: bool) -> Matcher {
    match input {
        MatcherInput::Flag(true) => Matcher::All,
        MatcherInput::Flag(false) | MatcherInput::Unset => Matcher::None,
        MatcherInput::Compiled(regexes) if regexes.is_empty() => Matcher::None,
        MatcherInput::Compiled(regexes) => {
            Matcher::Patterns(regexes.iter().cloned().map(Pattern::Regex).collect())
        }
        MatcherInput::List(items) => {
            let patterns: Vec<Pattern> = items
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| if case_fold { s.to_lowercase() } else { s.clone() })
                .filter_map(|s| {
                    if !as_pattern {
                        return Some(Pattern::Literal(s));
                    }
                    match Regex::new(&s) {
                        Ok(re) => Some(Pattern::Regex(re)),
                        Err(e) => {
                            tracing::warn!("Dropping invalid pattern {:?}: {}", s, e);
                            None
                        }
                    }
                })
                .collect();

            if patterns.is_empty() {
                Matcher::None
            } else {
                Matcher::Patterns(patterns)
            }
        }
    }
}
