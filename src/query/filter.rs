//! Label filters applied to partition keys.
//!
//! Filters are plain data: the index and scan layers compile regex
//! patterns once per lookup rather than caching compiled automata inside
//! the filter, keeping filters cheap to clone, compare and serialize
//! across plan boundaries.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Matching condition on a single label value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Exact equality.
    Equals(String),
    /// Inequality.
    NotEquals(String),
    /// Anchored regex match.
    EqualsRegex(String),
    /// Anchored regex non-match.
    NotEqualsRegex(String),
    /// Membership in an explicit value list.
    In(Vec<String>),
}

impl Filter {
    /// Whether this filter can seed an index posting lookup. Negations
    /// and regexes only narrow candidates found by other filters.
    pub fn is_selective(&self) -> bool {
        matches!(self, Filter::Equals(_) | Filter::In(_))
    }

    /// Evaluate against one value. Regex variants compile per call; use
    /// [`CompiledFilter`] when matching many values.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Filter::Equals(v) => value == v,
            Filter::NotEquals(v) => value != v,
            Filter::EqualsRegex(pattern) => match compile_anchored(pattern) {
                Ok(re) => re.is_match(value),
                Err(_) => false,
            },
            Filter::NotEqualsRegex(pattern) => match compile_anchored(pattern) {
                Ok(re) => !re.is_match(value),
                Err(_) => false,
            },
            Filter::In(values) => values.iter().any(|v| v == value),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals(v) => write!(f, "=\"{}\"", v),
            Filter::NotEquals(v) => write!(f, "!=\"{}\"", v),
            Filter::EqualsRegex(v) => write!(f, "=~\"{}\"", v),
            Filter::NotEqualsRegex(v) => write!(f, "!~\"{}\"", v),
            Filter::In(vs) => write!(f, " in ({})", vs.join(",")),
        }
    }
}

/// Anchor a PromQL-style pattern so it must match the whole value.
pub fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// A filter bound to a label column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFilter {
    /// Label name the filter applies to.
    pub column: String,
    /// The condition.
    pub filter: Filter,
}

impl ColumnFilter {
    /// Bind a filter to a column.
    pub fn new(column: impl Into<String>, filter: Filter) -> Self {
        Self {
            column: column.into(),
            filter,
        }
    }

    /// Equality shorthand.
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, Filter::Equals(value.into()))
    }
}

impl fmt::Display for ColumnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.column, self.filter)
    }
}

/// Filter with regex variants pre-compiled, for matching many values.
pub enum CompiledFilter {
    /// Non-regex variants evaluate directly.
    Plain(Filter),
    /// Compiled anchored regex, match wanted.
    Regex(Regex),
    /// Compiled anchored regex, non-match wanted.
    NotRegex(Regex),
}

impl CompiledFilter {
    /// Compile a filter, returning the pattern error for bad regexes.
    pub fn compile(filter: &Filter) -> Result<Self, regex::Error> {
        match filter {
            Filter::EqualsRegex(p) => Ok(CompiledFilter::Regex(compile_anchored(p)?)),
            Filter::NotEqualsRegex(p) => Ok(CompiledFilter::NotRegex(compile_anchored(p)?)),
            other => Ok(CompiledFilter::Plain(other.clone())),
        }
    }

    /// Evaluate against one value.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            CompiledFilter::Plain(f) => f.matches(value),
            CompiledFilter::Regex(re) => re.is_match(value),
            CompiledFilter::NotRegex(re) => !re.is_match(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equals_and_not_equals() {
        assert!(Filter::Equals("foo".into()).matches("foo"));
        assert!(!Filter::Equals("foo".into()).matches("foobar"));
        assert!(Filter::NotEquals("foo".into()).matches("bar"));
    }

    #[test]
    fn test_regex_is_anchored() {
        let f = Filter::EqualsRegex(".*Ns".into());
        assert!(f.matches("localNs"));
        assert!(f.matches("remoteNs"));
        assert!(!f.matches("NsSuffix"));

        // A bare prefix must not match as a substring.
        let f = Filter::EqualsRegex("local".into());
        assert!(!f.matches("localNs"));
    }

    #[test]
    fn test_in_filter() {
        let f = Filter::In(vec!["a".into(), "b".into()]);
        assert!(f.matches("a"));
        assert!(!f.matches("c"));
    }

    #[test]
    fn test_compiled_filter_matches_like_plain() {
        let f = Filter::NotEqualsRegex("h[0-9]+".into());
        let compiled = CompiledFilter::compile(&f).unwrap();
        assert_eq!(f.matches("h12"), compiled.matches("h12"));
        assert_eq!(f.matches("host"), compiled.matches("host"));
    }
}
