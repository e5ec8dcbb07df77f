#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("timestamp {millis} is out of range for epoch milliseconds")]
    InvalidTimestamp { millis: i64 },
    #[error("time range from {from} is after to {to}")]
    InvertedTimeRange { from: i64, to: i64 },
}

// ── Labels and fingerprints ─────────────────────────────────────────────

/// An ordered label set. Keys are kept sorted so the fingerprint and the
/// display form are deterministic regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels(BTreeMap<String, String>);

static EMPTY_LABELS: LazyLock<Labels> = LazyLock::new(Labels::new);

impl Labels {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every key/value pair of `self` also appears in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(k, v)| other.0.get(k).is_some_and(|ov| ov == v))
    }

    /// FNV-64a over the sorted key/value pairs, each followed by a 0xFF
    /// separator so `{"a": "bc"}` and `{"ab": "c"}` hash differently.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Fnv64::new();
        for (key, value) in &self.0 {
            hasher.write(key.as_bytes());
            hasher.write(&[0xFF]);
            hasher.write(value.as_bytes());
            hasher.write(&[0xFF]);
        }
        Fingerprint(hasher.finish())
    }

    /// Fingerprint over a subset of keys, processed in sorted order.
    /// Returns `None` when any requested key is absent.
    #[must_use]
    pub fn fingerprint_of(&self, keys: &[String]) -> Option<Fingerprint> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut hasher = Fnv64::new();
        for key in sorted {
            let value = self.0.get(key.as_str())?;
            hasher.write(key.as_bytes());
            hasher.write(&[0xFF]);
            hasher.write(value.as_bytes());
            hasher.write(&[0xFF]);
        }
        Some(Fingerprint(hasher.finish()))
    }

    /// Union of the two label sets; `self` wins on key conflicts.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut out = other.0.clone();
        for (k, v) in &self.0 {
            out.insert(k.clone(), v.clone());
        }
        Self(out)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}

/// Deterministic hash of a label set, used for dedup and partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

struct Fnv64 {
    state: u64,
}

impl Fnv64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Self {
            state: Self::OFFSET,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= u64::from(*byte);
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.state
    }
}

// ── Notices ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A non-fatal annotation attached to a value and surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub severity: Severity,
    pub text: String,
}

impl Notice {
    #[must_use]
    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            text: text.into(),
        }
    }
}

// ── Values ──────────────────────────────────────────────────────────────

/// A single unlabeled number. The value is nullable: `None` is a present
/// row with an unknown value, distinct from NaN which still computes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scalar {
    pub value: Option<f64>,
    pub notices: Vec<Notice>,
}

impl Scalar {
    #[must_use]
    pub fn new(value: Option<f64>) -> Self {
        Self {
            value,
            notices: Vec::new(),
        }
    }
}

/// A single labeled number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Number {
    pub labels: Labels,
    pub value: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub notices: Vec<Notice>,
}

impl Number {
    #[must_use]
    pub fn new(labels: Labels, value: Option<f64>) -> Self {
        Self {
            labels,
            value,
            metadata: None,
            notices: Vec::new(),
        }
    }
}

/// One sample of a series: a UTC timestamp and a nullable float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub value: Option<f64>,
}

/// A labeled, ordered sequence of points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub points: Vec<Point>,
    pub metadata: Option<serde_json::Value>,
    pub notices: Vec<Notice>,
}

impl Series {
    #[must_use]
    pub fn new(labels: Labels, points: Vec<Point>) -> Self {
        Self {
            labels,
            points,
            metadata: None,
            notices: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Explicit absence of data from an upstream node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoData {
    pub notices: Vec<Notice>,
}

/// Opaque tabular passthrough, e.g. output of an external SQL engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    pub labels: Labels,
    pub raw: serde_json::Value,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    Number,
    Series,
    NoData,
    Table,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scalar => "scalar",
            Self::Number => "number",
            Self::Series => "series",
            Self::NoData => "no data",
            Self::Table => "table",
        };
        f.write_str(name)
    }
}

/// The closed value sum every command and the evaluator operate on.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Number(Number),
    Series(Series),
    NoData(NoData),
    Table(TableData),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Scalar(_) => ValueKind::Scalar,
            Self::Number(_) => ValueKind::Number,
            Self::Series(_) => ValueKind::Series,
            Self::NoData(_) => ValueKind::NoData,
            Self::Table(_) => ValueKind::Table,
        }
    }

    /// The label set of this value; scalars and no-data are unlabeled.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        match self {
            Self::Number(v) => &v.labels,
            Self::Series(v) => &v.labels,
            Self::Table(v) => &v.labels,
            Self::Scalar(_) | Self::NoData(_) => &EMPTY_LABELS,
        }
    }

    /// Replace the label set; a no-op for unlabeled variants.
    pub fn set_labels(&mut self, labels: Labels) {
        match self {
            Self::Number(v) => v.labels = labels,
            Self::Series(v) => v.labels = labels,
            Self::Table(v) => v.labels = labels,
            Self::Scalar(_) | Self::NoData(_) => {}
        }
    }

    pub fn add_notice(&mut self, notice: Notice) {
        match self {
            Self::Scalar(v) => v.notices.push(notice),
            Self::Number(v) => v.notices.push(notice),
            Self::Series(v) => v.notices.push(notice),
            Self::NoData(v) => v.notices.push(notice),
            Self::Table(v) => v.notices.push(notice),
        }
    }
}

/// The ordered output of one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    pub values: Vec<Value>,
}

impl Results {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn no_data() -> Self {
        Self {
            values: vec![Value::NoData(NoData::default())],
        }
    }

    #[must_use]
    pub fn is_no_data(&self) -> bool {
        self.values.len() == 1 && matches!(self.values[0], Value::NoData(_))
    }
}

/// Shared execution state: refId → Results. Written exactly once per key
/// by the node owning that refId, read by its dependents.
pub type Vars = HashMap<String, Results>;

// ── Time ranges ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn from_epoch_millis(from: i64, to: i64) -> Result<Self, ValueError> {
        if from > to {
            return Err(ValueError::InvertedTimeRange { from, to });
        }
        let from = DateTime::<Utc>::from_timestamp_millis(from)
            .ok_or(ValueError::InvalidTimestamp { millis: from })?;
        let to = DateTime::<Utc>::from_timestamp_millis(to)
            .ok_or(ValueError::InvalidTimestamp { millis: to })?;
        Ok(Self { from, to })
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.to - self.from
    }
}
