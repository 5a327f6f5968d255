//! Budgeted top-K selection over a score-sorted cross-bucket union.
//!
//! The scan walks the union from the highest score down, filling each result
//! category until it holds `item_count` entries, and gives up after
//! `check_at_most` members. Bounded latency is chosen over completeness: a
//! sparse category may legitimately come back short when the budget runs out
//! first.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::event::{AttrValue, Event, Outcome};

/// One ranked identifier within a result category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub identifier: String,
    pub count: u64,
}

/// Top entries per result category, each in descending-score order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rankings {
    pub allowed: Vec<RankEntry>,
    pub rate_limited: Vec<RankEntry>,
    pub denied: Vec<RankEntry>,
}

impl Rankings {
    fn slot(&mut self, outcome: Outcome) -> &mut Vec<RankEntry> {
        match outcome {
            Outcome::Allowed => &mut self.allowed,
            Outcome::RateLimited => &mut self.rate_limited,
            Outcome::Denied => &mut self.denied,
        }
    }

    fn saturated(&self, item_count: usize) -> bool {
        self.allowed.len() >= item_count
            && self.rate_limited.len() >= item_count
            && self.denied.len() >= item_count
    }
}

/// Fills each category from the score-descending `union`.
///
/// Every examined member counts against `check_at_most`, whether or not it
/// lands anywhere; zero scores and unresolvable discriminators are never
/// appended. Categories short of `item_count` when the budget runs out are
/// returned as-is.
pub(crate) fn select_top(
    union: &[(String, u64)],
    outcome_field: &str,
    item_count: usize,
    check_at_most: usize,
) -> Rankings {
    let mut out = Rankings::default();
    if item_count == 0 {
        return out;
    }
    let mut checked = 0usize;
    for (member, score) in union {
        if checked >= check_at_most || out.saturated(item_count) {
            break;
        }
        checked += 1;
        if *score == 0 {
            continue;
        }
        let attrs = match Event::parse_member(member) {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!("skipping unparsable member {:?}: {}", member, e);
                continue;
            }
        };
        let outcome = match Outcome::from_attrs(&attrs, outcome_field) {
            Some(outcome) => outcome,
            None => {
                warn!("skipping member with unresolvable {:?} field: {}", outcome_field, member);
                continue;
            }
        };
        let slot = out.slot(outcome);
        if slot.len() < item_count {
            slot.push(RankEntry {
                identifier: identifier_of(&attrs, outcome_field),
                count: *score,
            });
        }
    }
    out
}

/// The member minus its discriminator attribute.
///
/// A single remaining attribute collapses to its bare scalar string; several
/// render as canonical JSON.
fn identifier_of(attrs: &BTreeMap<String, AttrValue>, outcome_field: &str) -> String {
    let rest: BTreeMap<&str, &AttrValue> = attrs
        .iter()
        .filter(|(k, _)| k.as_str() != outcome_field)
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    match rest.len() {
        0 => String::new(),
        1 => rest.values().next().map(|v| v.label()).unwrap_or_default(),
        _ => serde_json::to_string(&rest).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, DENIED_MARKER};

    fn member(ip: &str, allowed: impl Into<AttrValue>) -> String {
        Event::new()
            .attr("ip", ip)
            .attr("allowed", allowed)
            .member()
            .unwrap()
    }

    #[test]
    fn splits_categories_and_keeps_score_order() {
        let union = vec![
            (member("A", true), 10),
            (member("B", false), 5),
            (member("D", DENIED_MARKER), 3),
            (member("C", true), 1),
        ];
        let r = select_top(&union, "allowed", 1, 20);
        assert_eq!(
            r.allowed,
            vec![RankEntry { identifier: "A".to_owned(), count: 10 }]
        );
        assert_eq!(
            r.rate_limited,
            vec![RankEntry { identifier: "B".to_owned(), count: 5 }]
        );
        assert_eq!(
            r.denied,
            vec![RankEntry { identifier: "D".to_owned(), count: 3 }]
        );
    }

    #[test]
    fn early_exit_budget_stops_the_scan() {
        let union = vec![
            (member("A", true), 10),
            (member("B", false), 5),
            (member("C", true), 1),
        ];
        // only the single highest entry is ever examined
        let r = select_top(&union, "allowed", 1, 1);
        assert_eq!(r.allowed.len(), 1);
        assert!(r.rate_limited.is_empty());
        assert!(r.denied.is_empty());
    }

    #[test]
    fn full_categories_are_skipped_not_restarted() {
        let union = vec![
            (member("A", true), 10),
            (member("B", true), 9),
            (member("C", true), 8),
            (member("D", false), 7),
        ];
        let r = select_top(&union, "allowed", 2, 10);
        assert_eq!(r.allowed.len(), 2);
        assert_eq!(r.allowed[0].identifier, "A");
        assert_eq!(r.allowed[1].identifier, "B");
        // C skipped because allowed was full; D still landed
        assert_eq!(r.rate_limited[0].identifier, "D");
    }

    #[test]
    fn zero_scores_and_odd_discriminators_never_land() {
        let union = vec![
            (member("A", true), 0),
            (member("B", 12i64), 9),
            ("not json".to_owned(), 8),
            (member("C", true), 7),
        ];
        let r = select_top(&union, "allowed", 1, 10);
        assert_eq!(r.allowed, vec![RankEntry { identifier: "C".to_owned(), count: 7 }]);
        assert!(r.rate_limited.is_empty());
        assert!(r.denied.is_empty());
    }

    #[test]
    fn zero_item_count_returns_empty() {
        let union = vec![(member("A", true), 10)];
        let r = select_top(&union, "allowed", 0, 10);
        assert_eq!(r, Rankings::default());
    }

    #[test]
    fn multi_attribute_identifiers_render_as_json() {
        let m = Event::new()
            .attr("ip", "10.0.0.1")
            .attr("path", "/login")
            .attr("allowed", true)
            .member()
            .unwrap();
        let r = select_top(&[(m, 4)], "allowed", 1, 10);
        assert_eq!(r.allowed[0].identifier, r#"{"ip":"10.0.0.1","path":"/login"}"#);
    }
}
