//! Metric line format and its parsed form.
//!
//! Collectors emit [`MetricLine`]s, one per sink call:
//!
//! ```text
//! <metric-name> <unix-timestamp> <value> [<tag>=<value> ...]
//! ```
//!
//! The sender parses each line into a [`MetricEntry`], merging the agent's
//! global tags and enforcing the per-entry tag cap.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag map carried by an entry (keys unique, sorted on the wire).
pub type Tags = BTreeMap<String, String>;

/// Errors raised while parsing a metric line.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    /// Fewer than three whitespace-separated fields.
    #[error("expected '<metric> <timestamp> <value> [tags]', got {0} field(s)")]
    MissingFields(usize),

    /// Metric name contains characters outside `[-_./a-zA-Z0-9]`.
    #[error("invalid metric name '{0}'")]
    InvalidName(String),

    /// Timestamp is not an integer.
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// Value is neither an integer nor a finite float.
    #[error("invalid value '{0}'")]
    InvalidValue(String),

    /// Tag is not `key=value` or the key has invalid characters.
    #[error("invalid tag '{0}'")]
    InvalidTag(String),
}

fn name_regex() -> &'static Regex {
    static NAME_REGEX: OnceLock<Regex> = OnceLock::new();
    NAME_REGEX.get_or_init(|| {
        Regex::new(r"^[-_./a-zA-Z0-9]+$").expect("failed to compile metric name regex")
    })
}

/// Returns true if `name` is a valid metric name or tag key.
pub fn is_valid_name(name: &str) -> bool {
    name_regex().is_match(name)
}

/// Parse a single `key=value` tag.
pub fn parse_tag(raw: &str) -> Result<(String, String), ParseError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ParseError::InvalidTag(raw.to_string()))?;
    if !is_valid_name(key) || value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(ParseError::InvalidTag(raw.to_string()));
    }
    Ok((key.to_string(), value.to_string()))
}

// =============================================================================
// MetricLine
// =============================================================================

/// Builder for the textual line format emitted by collectors.
///
/// ```
/// use ferry::MetricLine;
///
/// let line = MetricLine::new("demo.metric", 1_700_000_000, 42.0).tag("host", "test");
/// assert_eq!(line.to_string(), "demo.metric 1700000000 42 host=test");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MetricLine {
    metric: String,
    timestamp: i64,
    value: f64,
    tags: Vec<(String, String)>,
}

impl MetricLine {
    /// Create a line without tags.
    pub fn new(metric: impl Into<String>, timestamp: i64, value: f64) -> Self {
        Self {
            metric: metric.into(),
            timestamp,
            value,
            tags: Vec::new(),
        }
    }

    /// Create a line stamped with the current time.
    pub fn now(metric: impl Into<String>, value: f64) -> Self {
        Self::new(metric, chrono::Utc::now().timestamp(), value)
    }

    /// Append a tag. Tags keep insertion order.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Append every tag of a map.
    pub fn tags<'a>(mut self, tags: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

impl fmt::Display for MetricLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.timestamp, self.value)?;
        for (k, v) in &self.tags {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

// =============================================================================
// MetricEntry
// =============================================================================

/// Parsed metric ready for transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: Tags,
}

/// Result of parsing one line, including how many per-line tags were cut.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub entry: MetricEntry,
    pub dropped_tags: Vec<String>,
}

impl MetricEntry {
    /// Parse a raw line, merging `global_tags` and capping the total tag count.
    ///
    /// Global tags always win: a per-line tag with the same key is ignored,
    /// and per-line tags beyond `max_tags - global_tags.len()` are dropped in
    /// input order. Duplicate per-line keys keep their first value.
    pub fn parse(line: &str, global_tags: &Tags, max_tags: usize) -> Result<Parsed, ParseError> {
        let mut fields = line.split_whitespace();
        let (Some(metric), Some(ts), Some(value)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(ParseError::MissingFields(line.split_whitespace().count()));
        };

        if !is_valid_name(metric) {
            return Err(ParseError::InvalidName(metric.to_string()));
        }

        let timestamp: i64 = ts
            .parse()
            .map_err(|_| ParseError::InvalidTimestamp(ts.to_string()))?;

        let value = parse_value(value)?;

        let mut tags = global_tags.clone();
        let mut dropped_tags = Vec::new();
        for raw in fields {
            let (key, val) = parse_tag(raw)?;
            if tags.contains_key(&key) {
                continue;
            }
            if tags.len() >= max_tags {
                dropped_tags.push(key);
                continue;
            }
            tags.insert(key, val);
        }

        Ok(Parsed {
            entry: MetricEntry {
                metric: metric.to_string(),
                timestamp,
                value,
                tags,
            },
            dropped_tags,
        })
    }
}

fn parse_value(raw: &str) -> Result<f64, ParseError> {
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(int as f64);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidValue(raw.to_string())),
    }
}
