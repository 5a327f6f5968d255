//! Time windows and bucket key derivation.
//!
//! Events are sharded into fixed-duration buckets. A [`Window`] is the
//! configured bucket duration; a [`BucketKey`] names one bucket of one table
//! and serializes to `{prefix}:{table}:{bucketStartMs}`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Current wall-clock time in epoch milliseconds.
#[inline]
pub(crate) fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// A fixed bucket duration, always strictly positive.
///
/// Constructed from an explicit millisecond count or parsed from a
/// `{integer}{s|m|h|d}` string such as `"90s"` or `"1h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    size_ms: i64,
}

impl Window {
    /// Creates a window from an explicit duration in milliseconds.
    pub fn from_millis(size_ms: i64) -> Result<Self> {
        if size_ms <= 0 {
            return Err(Error::InvalidWindow(size_ms.to_string()));
        }
        Ok(Self { size_ms })
    }

    /// Parses a `{integer}{s|m|h|d}` duration string.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidWindow(value.to_owned());
        let mut chars = value.chars();
        let unit = chars.next_back().ok_or_else(invalid)?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        let per_unit = match unit {
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => return Err(invalid()),
        };
        let size_ms = n.checked_mul(per_unit).ok_or_else(invalid)?;
        Self::from_millis(size_ms)
    }

    #[inline]
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    #[inline]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.size_ms as u64)
    }

    /// Inclusive start of the bucket containing `time_ms`.
    ///
    /// Floor division, so pre-epoch timestamps still round downward.
    #[inline]
    pub fn bucket_start(&self, time_ms: TimestampMs) -> TimestampMs {
        time_ms.div_euclid(self.size_ms) * self.size_ms
    }
}

impl Default for Window {
    /// One hour.
    fn default() -> Self {
        Self { size_ms: 3_600_000 }
    }
}

impl FromStr for Window {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.size_ms)
    }
}

/// Checks a caller-chosen table name against `[A-Za-z0-9_-]+`.
///
/// Invalid names fail hard; nothing is ever sanitized.
pub fn validate_table(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(Error::InvalidTableName(name.to_owned()));
    }
    Ok(())
}

/// Names one bucket of one table in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub prefix: String,
    pub table: String,
    /// Inclusive window start, a multiple of the bucket size.
    pub start: TimestampMs,
}

impl BucketKey {
    pub fn new(prefix: &str, table: &str, start: TimestampMs) -> Self {
        Self {
            prefix: prefix.to_owned(),
            table: table.to_owned(),
            start,
        }
    }

    /// Derives the key for the bucket containing `time_ms`.
    pub fn derive(prefix: &str, table: &str, window: Window, time_ms: TimestampMs) -> Self {
        Self::new(prefix, table, window.bucket_start(time_ms))
    }

    /// Parses a serialized `{prefix}:{table}:{start}` key.
    ///
    /// Splits from the right: the table charset excludes `:`, so a prefix
    /// containing `:` still round-trips.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || Error::MalformedKey(raw.to_owned());
        let (head, start) = raw.rsplit_once(':').ok_or_else(malformed)?;
        let start: i64 = start.parse().map_err(|_| malformed())?;
        let (prefix, table) = head.rsplit_once(':').ok_or_else(malformed)?;
        if prefix.is_empty() || table.is_empty() {
            return Err(malformed());
        }
        Ok(Self::new(prefix, table, start))
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.table, self.start)
    }
}
