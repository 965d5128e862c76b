//! Core data model: samples, label sets, fingerprints, and label matchers.

use crate::{Error, Result};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// 64-bit hash of a label set. Stable across processes; not uniquely
/// identifying on its own, so series identity is always label-set equality.
pub type Fingerprint = u64;

/// A single time-series sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// An immutable label set in canonical (sorted-by-name) order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a label set from name/value pairs. Later duplicates win.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Value of the `__name__` label, if present.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Label names must be non-empty. Values may be anything, including
    /// empty strings.
    pub fn validate(&self) -> Result<()> {
        if self.0.keys().any(|n| n.is_empty()) {
            return Err(Error::InvalidLabels(format!(
                "empty label name in {self}"
            )));
        }
        Ok(())
    }

    /// BLAKE3 hash of the canonical pair sequence, truncated to 64 bits.
    /// The 0xff separator keeps `("ab","c")` and `("a","bc")` apart.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in self.iter() {
            hasher.update(name.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(value.as_bytes());
            hasher.update(&[0xff]);
        }
        let hash = hasher.finalize();
        let mut out = [0u8; 8];
        out.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(out)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        write!(f, "}}")
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

/// Matcher operator, mirroring the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatcherType {
    /// Exact equality
    Eq,
    /// Negated equality
    NotEq,
    /// Anchored regular expression match
    Re,
    /// Negated anchored regular expression match
    NotRe,
}

/// Wire form of a label matcher, as carried in a query request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelMatcher {
    pub matcher_type: MatcherType,
    pub name: String,
    pub value: String,
}

impl LabelMatcher {
    pub fn new(
        matcher_type: MatcherType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            matcher_type,
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug)]
enum MatcherKind {
    Eq(String),
    NotEq(String),
    Re(Regex),
    NotRe(Regex),
}

/// A compiled label matcher. Regular expressions are anchored at both ends,
/// so `Re("a|b")` matches exactly `a` or `b`.
#[derive(Debug)]
pub struct Matcher {
    name: String,
    kind: MatcherKind,
}

impl Matcher {
    pub fn new(
        matcher_type: MatcherType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        let kind = match matcher_type {
            MatcherType::Eq => MatcherKind::Eq(value),
            MatcherType::NotEq => MatcherKind::NotEq(value),
            MatcherType::Re | MatcherType::NotRe => {
                let re = Regex::new(&format!("^(?:{value})$")).map_err(|e| {
                    Error::InvalidMatcher(format!("bad regex {value:?} for label {name:?}: {e}"))
                })?;
                match matcher_type {
                    MatcherType::Re => MatcherKind::Re(re),
                    _ => MatcherKind::NotRe(re),
                }
            }
        };
        Ok(Self { name, kind })
    }

    pub fn compile(m: &LabelMatcher) -> Result<Self> {
        Self::new(m.matcher_type, &m.name, &m.value)
    }

    /// For equality matchers, the `(name, value)` pair usable as a postings
    /// key. `None` for every other operator.
    pub fn equality(&self) -> Option<(&str, &str)> {
        match &self.kind {
            MatcherKind::Eq(v) => Some((&self.name, v)),
            _ => None,
        }
    }

    /// A label absent from the set matches as the empty string.
    pub fn matches(&self, labels: &Labels) -> bool {
        let actual = labels.get(&self.name).unwrap_or("");
        match &self.kind {
            MatcherKind::Eq(v) => actual == v,
            MatcherKind::NotEq(v) => actual != v,
            MatcherKind::Re(re) => re.is_match(actual),
            MatcherKind::NotRe(re) => !re.is_match(actual),
        }
    }
}

/// A batch of samples for one series, used both in write requests and
/// query responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// Inbound write request: a batch of series, each with one or more samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    pub timeseries: Vec<TimeSeries>,
}

impl WriteRequest {
    /// Convenience constructor for a batch of single samples.
    pub fn from_samples(samples: impl IntoIterator<Item = (Labels, Sample)>) -> Self {
        Self {
            timeseries: samples
                .into_iter()
                .map(|(labels, sample)| TimeSeries {
                    labels,
                    samples: vec![sample],
                })
                .collect(),
        }
    }
}

/// Inbound query request over an inclusive time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub start_ms: i64,
    pub end_ms: i64,
    pub matchers: Vec<LabelMatcher>,
}
