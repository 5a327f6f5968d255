//! Event data model and canonical counter identity.
//!
//! An [`Event`] is an optional explicit timestamp plus an open set of scalar
//! attributes. The timestamp only selects the bucket; the counter identity is
//! the attributes alone, encoded as compact JSON with deterministic key order
//! (the attribute map is a `BTreeMap`). Two events with equal attributes and
//! timestamps in the same bucket hit the same counter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::window::TimestampMs;

/// Marker value a denial outcome is recorded under.
pub const DENIED_MARKER: &str = "denied";

/// A scalar attribute value. Encodes as a bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    /// Literal string form used for group labels and ranked identifiers.
    pub fn label(&self) -> String {
        match self {
            AttrValue::Bool(true) => "true".to_owned(),
            AttrValue::Bool(false) => "false".to_owned(),
            AttrValue::Int(n) => n.to_string(),
            AttrValue::Float(x) => x.to_string(),
            AttrValue::Str(s) => s.clone(),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// Attribute map of one event or counter identity.
pub type Attrs = BTreeMap<String, AttrValue>;

/// A single recorded occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event time in epoch ms; the current wall clock when `None`.
    pub timestamp: Option<TimestampMs>,
    pub attrs: Attrs,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// An event pinned to an explicit timestamp.
    pub fn at(timestamp: TimestampMs) -> Self {
        Self {
            timestamp: Some(timestamp),
            attrs: Attrs::new(),
        }
    }

    /// Adds one attribute, builder style.
    pub fn attr<V: Into<AttrValue>>(mut self, key: &str, value: V) -> Self {
        self.attrs.insert(key.to_owned(), value.into());
        self
    }

    /// Canonical counter identity: attributes only, keys sorted, compact JSON.
    pub fn member(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.attrs)?)
    }

    /// Inverse of [`Event::member`].
    pub fn parse_member(raw: &str) -> Result<Attrs> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Result category embedded in a counter identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    RateLimited,
    Denied,
}

impl Outcome {
    /// Resolves the category from the discriminator attribute.
    ///
    /// Boolean `true` means allowed, boolean `false` or an absent field means
    /// rate-limited (absence normalizes to `false`, matching group-by
    /// aggregation), and the `"denied"` marker means denied. Anything else
    /// does not resolve.
    pub fn from_attrs(attrs: &Attrs, field: &str) -> Option<Self> {
        match attrs.get(field) {
            Some(AttrValue::Bool(true)) => Some(Outcome::Allowed),
            Some(AttrValue::Bool(false)) | None => Some(Outcome::RateLimited),
            Some(AttrValue::Str(s)) if s == DENIED_MARKER => Some(Outcome::Denied),
            _ => None,
        }
    }
}

/// Normalizes one attribute value into its group-by label.
///
/// Boolean-like success indicators collapse to `"true"`/`"false"` (absence
/// counts as `"false"`); any other literal passes through unchanged.
pub fn group_label(value: Option<&AttrValue>) -> String {
    match value {
        None => "false".to_owned(),
        Some(v) => v.label(),
    }
}

/// One bucket's counters folded by a chosen attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Inclusive bucket start, epoch ms.
    pub time: TimestampMs,
    /// The attribute the fold grouped by.
    pub field: String,
    /// Group label to summed count.
    pub totals: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_is_canonical_and_timestamp_free() {
        let a = Event::at(1_700_000_000_000)
            .attr("path", "/login")
            .attr("allowed", true);
        let b = Event::new().attr("allowed", true).attr("path", "/login");
        // same attributes, different insertion order and timestamps
        assert_eq!(a.member().unwrap(), b.member().unwrap());
        assert_eq!(a.member().unwrap(), r#"{"allowed":true,"path":"/login"}"#);
    }

    #[test]
    fn member_round_trips() {
        let ev = Event::new()
            .attr("ip", "10.0.0.1")
            .attr("allowed", false)
            .attr("tries", 3i64)
            .attr("score", 0.5);
        let attrs = Event::parse_member(&ev.member().unwrap()).unwrap();
        assert_eq!(attrs, ev.attrs);
    }

    #[test]
    fn outcome_resolution() {
        let allowed = Event::new().attr("ip", "a").attr("allowed", true).attrs;
        let limited = Event::new().attr("ip", "b").attr("allowed", false).attrs;
        let absent = Event::new().attr("ip", "c").attrs;
        let denied = Event::new().attr("ip", "d").attr("allowed", DENIED_MARKER).attrs;
        let odd = Event::new().attr("ip", "e").attr("allowed", 7i64).attrs;

        assert_eq!(Outcome::from_attrs(&allowed, "allowed"), Some(Outcome::Allowed));
        assert_eq!(Outcome::from_attrs(&limited, "allowed"), Some(Outcome::RateLimited));
        assert_eq!(Outcome::from_attrs(&absent, "allowed"), Some(Outcome::RateLimited));
        assert_eq!(Outcome::from_attrs(&denied, "allowed"), Some(Outcome::Denied));
        assert_eq!(Outcome::from_attrs(&odd, "allowed"), None);
    }

    #[test]
    fn group_labels_normalize_booleans() {
        assert_eq!(group_label(Some(&AttrValue::Bool(true))), "true");
        assert_eq!(group_label(Some(&AttrValue::Bool(false))), "false");
        assert_eq!(group_label(None), "false");
        assert_eq!(group_label(Some(&AttrValue::Str(DENIED_MARKER.into()))), "denied");
        assert_eq!(group_label(Some(&AttrValue::Int(42))), "42");
    }
}
