//! Log record model shared by log sources and the query engine.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// String-keyed label map attached to a record at line, scope or resource level.
pub type Attrs = BTreeMap<String, String>;

/// Instant with nanosecond resolution, counted from the Unix epoch.
///
/// The zero value doubles as "unset" for optional time bounds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Converts a wall-clock time, clamping instants before the epoch to zero.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let nanos = dt.timestamp_nanos_opt().unwrap_or(i64::MAX);
        Self(u64::try_from(nanos).unwrap_or(0))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch, truncated.
    pub const fn unix_seconds(self) -> i64 {
        (self.0 / 1_000_000_000) as i64
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn as_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(i64::try_from(self.0).unwrap_or(i64::MAX))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(d)))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(duration_nanos(rhs)))
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_datetime().to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// A single log line.
///
/// Iterators fill a caller-owned `Record` in place: every successful pull
/// overwrites all fields. Callers that need a record after the next pull must
/// clone it (or move fields out) first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: Timestamp,
    pub observed_timestamp: Timestamp,
    pub body: String,
    pub attrs: Attrs,
    pub scope_attrs: Attrs,
    pub resource_attrs: Attrs,
}

impl Record {
    /// Create a record whose observed timestamp equals its timestamp.
    pub fn new(timestamp: Timestamp, body: impl Into<String>) -> Self {
        Self {
            timestamp,
            observed_timestamp: timestamp,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_scope_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.scope_attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attrs.insert(key.into(), value.into());
        self
    }
}
