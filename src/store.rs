//! The ordered score-store seam and an in-memory reference backend.
//!
//! [`ScoreStore`] captures the exact capabilities the engine consumes:
//! atomic member increments, atomic score-sorted unions, bulk fetch,
//! server-side group-by folds, cursor-based key enumeration, deletion, and
//! pipelined submission. A remote adapter (e.g. over a Redis-style store)
//! implements this trait with its own scripting or transaction primitive;
//! [`MemStore`] implements it in memory behind a whole-store lock, which
//! makes every call atomic with respect to concurrent writers.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::event::{group_label, Event};

/// One bucket-level operation submitted through a pipelined batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Bulk-fetch the full contents of a bucket.
    Fetch(String),
    /// Server-side group-by fold of a bucket by an attribute.
    Fold { key: String, field: String },
    /// Delete a bucket.
    Remove(String),
}

/// Reply to one [`StoreOp`], aligned by index with the submitted batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    /// Members with scores, ordered score-descending then member-ascending.
    Contents(Vec<(String, u64)>),
    /// Group label to summed count.
    Folded(BTreeMap<String, u64>),
    /// Whether the deleted bucket existed.
    Removed(bool),
}

/// Remote ordered key/score store capabilities.
///
/// Absent buckets behave as empty everywhere; no method treats them as an
/// error. Each method must be atomic with respect to concurrent calls.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Atomically adds `by` to `member`'s score inside `key`, creating the
    /// bucket and the member as needed. Returns the new score.
    async fn increment(&self, key: &str, member: &str, by: u64) -> Result<u64>;

    /// Atomic union of `keys`: every member's combined score is the sum of
    /// its per-bucket scores. Ordered by score descending; equal scores
    /// order by member ascending (the store's stable secondary order).
    async fn union(&self, keys: &[String]) -> Result<Vec<(String, u64)>>;

    /// Full contents of one bucket, ordered like [`ScoreStore::union`].
    async fn fetch(&self, key: &str) -> Result<Vec<(String, u64)>>;

    /// Server-side fold of one bucket's counters by `field`, summing counts
    /// per normalized group label. Executes as one atomic operation over the
    /// bucket, never as fetch-then-fold on the client.
    async fn fold(&self, key: &str, field: &str) -> Result<BTreeMap<String, u64>>;

    /// Enumerates bucket keys matching a `*`-wildcard pattern starting at
    /// `cursor`. Returns the next cursor (0 when the scan is complete) and a
    /// page of keys. Best effort under concurrent mutation.
    async fn scan(&self, pattern: &str, cursor: u64) -> Result<(u64, Vec<String>)>;

    /// Deletes one bucket. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Submits `ops` in one round trip; reply `i` answers op `i`.
    async fn pipeline(&self, ops: &[StoreOp]) -> Result<Vec<StoreReply>>;
}

type Buckets = HashMap<String, BTreeMap<String, u64>>;

/// An in-memory [`ScoreStore`] for tests and single-process use.
///
/// Every method takes the whole-store lock, so increments, folds, unions,
/// and whole pipelined batches are each atomic.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Buckets>,
}

const SCAN_PAGE: usize = 64;

impl MemStore {
    /// Creates an empty `MemStore`.
    #[inline]
    pub fn create() -> Self {
        Self::default()
    }

    fn read_inner(&self) -> Result<std::sync::RwLockReadGuard<'_, Buckets>> {
        self.inner.read().map_err(|_| Error::Msg("store lock poisoned".into()))
    }

    fn write_inner(&self) -> Result<std::sync::RwLockWriteGuard<'_, Buckets>> {
        self.inner.write().map_err(|_| Error::Msg("store lock poisoned".into()))
    }

    fn fetch_locked(buckets: &Buckets, key: &str) -> Vec<(String, u64)> {
        let mut contents: Vec<(String, u64)> = buckets
            .get(key)
            .map(|b| b.iter().map(|(m, c)| (m.clone(), *c)).collect())
            .unwrap_or_default();
        contents.sort_by(|a, b| (Reverse(a.1), &a.0).cmp(&(Reverse(b.1), &b.0)));
        contents
    }

    fn fold_locked(buckets: &Buckets, key: &str, field: &str) -> Result<BTreeMap<String, u64>> {
        let mut totals = BTreeMap::new();
        if let Some(bucket) = buckets.get(key) {
            for (member, count) in bucket {
                let attrs = Event::parse_member(member)?;
                let label = group_label(attrs.get(field));
                *totals.entry(label).or_insert(0) += count;
            }
        }
        Ok(totals)
    }

    fn remove_locked(buckets: &mut Buckets, key: &str) -> bool {
        buckets.remove(key).is_some()
    }
}

#[async_trait]
impl ScoreStore for MemStore {
    async fn increment(&self, key: &str, member: &str, by: u64) -> Result<u64> {
        let mut buckets = self.write_inner()?;
        let score = buckets
            .entry(key.to_owned())
            .or_default()
            .entry(member.to_owned())
            .or_insert(0);
        *score += by;
        Ok(*score)
    }

    async fn union(&self, keys: &[String]) -> Result<Vec<(String, u64)>> {
        let buckets = self.read_inner()?;
        let mut combined: BTreeMap<String, u64> = BTreeMap::new();
        for key in keys {
            if let Some(bucket) = buckets.get(key) {
                for (member, count) in bucket {
                    *combined.entry(member.clone()).or_insert(0) += count;
                }
            }
        }
        let mut scored: Vec<(String, u64)> = combined.into_iter().collect();
        scored.sort_by(|a, b| (Reverse(a.1), &a.0).cmp(&(Reverse(b.1), &b.0)));
        Ok(scored)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<(String, u64)>> {
        let buckets = self.read_inner()?;
        Ok(Self::fetch_locked(&buckets, key))
    }

    async fn fold(&self, key: &str, field: &str) -> Result<BTreeMap<String, u64>> {
        let buckets = self.read_inner()?;
        Self::fold_locked(&buckets, key, field)
    }

    async fn scan(&self, pattern: &str, cursor: u64) -> Result<(u64, Vec<String>)> {
        let buckets = self.read_inner()?;
        let mut matching: Vec<String> = buckets
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        matching.sort();
        let start = cursor as usize;
        if start >= matching.len() {
            return Ok((0, Vec::new()));
        }
        let end = (start + SCAN_PAGE).min(matching.len());
        let next = if end < matching.len() { end as u64 } else { 0 };
        Ok((next, matching[start..end].to_vec()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut buckets = self.write_inner()?;
        Ok(Self::remove_locked(&mut buckets, key))
    }

    async fn pipeline(&self, ops: &[StoreOp]) -> Result<Vec<StoreReply>> {
        // one lock for the whole batch: the batch is atomic or fails whole
        let mut buckets = self.write_inner()?;
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = match op {
                StoreOp::Fetch(key) => StoreReply::Contents(Self::fetch_locked(&buckets, key)),
                StoreOp::Fold { key, field } => {
                    StoreReply::Folded(Self::fold_locked(&buckets, key, field)?)
                }
                StoreOp::Remove(key) => StoreReply::Removed(Self::remove_locked(&mut buckets, key)),
            };
            replies.push(reply);
        }
        Ok(replies)
    }
}

/// Matches `pattern` against `text` where `*` matches any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let segments: Vec<&str> = pattern.split('*').collect();
    let first = segments[0];
    let last = segments[segments.len() - 1];
    if !text.starts_with(first)
        || !text.ends_with(last)
        || text.len() < first.len() + last.len()
    {
        return false;
    }
    let mut rest = &text[first.len()..text.len() - last.len()];
    for seg in &segments[1..segments.len() - 1] {
        if seg.is_empty() {
            continue;
        }
        match rest.find(seg) {
            Some(pos) => rest = &rest[pos + seg.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn member(ip: &str, allowed: bool) -> String {
        Event::new()
            .attr("ip", ip)
            .attr("allowed", allowed)
            .member()
            .unwrap()
    }

    #[tokio::test]
    async fn increment_accumulates_per_member() {
        let store = MemStore::create();
        assert_eq!(store.increment("k:t:0", "m", 1).await.unwrap(), 1);
        assert_eq!(store.increment("k:t:0", "m", 1).await.unwrap(), 2);
        assert_eq!(store.increment("k:t:0", "other", 1).await.unwrap(), 1);
        assert_eq!(store.increment("k:t:60", "m", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn union_sums_and_orders() {
        let store = MemStore::create();
        store.increment("k:t:0", "a", 3).await.unwrap();
        store.increment("k:t:60", "a", 2).await.unwrap();
        store.increment("k:t:60", "b", 5).await.unwrap();
        store.increment("k:t:60", "c", 5).await.unwrap();

        let keys = vec!["k:t:0".to_owned(), "k:t:60".to_owned(), "k:t:120".to_owned()];
        let union = store.union(&keys).await.unwrap();
        // a=5 ties b=5 and c=5; ties order by member ascending
        assert_eq!(
            union,
            vec![
                ("a".to_owned(), 5),
                ("b".to_owned(), 5),
                ("c".to_owned(), 5),
            ]
        );
    }

    #[tokio::test]
    async fn union_of_absent_buckets_is_empty() {
        let store = MemStore::create();
        let union = store.union(&["nope:t:0".to_owned()]).await.unwrap();
        assert!(union.is_empty());
    }

    #[tokio::test]
    async fn fold_groups_by_field() {
        let store = MemStore::create();
        store.increment("k:t:0", &member("a", true), 2).await.unwrap();
        store.increment("k:t:0", &member("b", true), 1).await.unwrap();
        store.increment("k:t:0", &member("c", false), 4).await.unwrap();

        let totals = store.fold("k:t:0", "allowed").await.unwrap();
        assert_eq!(totals.get("true"), Some(&3));
        assert_eq!(totals.get("false"), Some(&4));

        // grouping by a field the members lack lands everything on "false"
        let totals = store.fold("k:t:0", "missing").await.unwrap();
        assert_eq!(totals.get("false"), Some(&7));

        assert!(store.fold("k:t:999", "allowed").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_pages_through_matches() {
        let store = MemStore::create();
        for i in 0..150 {
            store
                .increment(&format!("bkt:reqs:{}", i * 60_000), "m", 1)
                .await
                .unwrap();
        }
        store.increment("bkt:other:0", "m", 1).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, page) = store.scan("bkt:reqs:*", cursor).await.unwrap();
            seen.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 150);
        assert!(seen.iter().all(|k| k.starts_with("bkt:reqs:")));
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let store = MemStore::create();
        store.increment("k:t:0", "m", 1).await.unwrap();
        assert!(store.remove("k:t:0").await.unwrap());
        assert!(!store.remove("k:t:0").await.unwrap());
        assert!(store.fetch("k:t:0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pipeline_replies_line_up() {
        let store = MemStore::create();
        store.increment("k:t:0", &member("a", true), 2).await.unwrap();
        store.increment("k:t:60", "raw", 1).await.unwrap();

        let ops = vec![
            StoreOp::Fetch("k:t:60".to_owned()),
            StoreOp::Fold {
                key: "k:t:0".to_owned(),
                field: "allowed".to_owned(),
            },
            StoreOp::Remove("k:t:60".to_owned()),
            StoreOp::Remove("k:t:60".to_owned()),
        ];
        let replies = store.pipeline(&ops).await.unwrap();
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0], StoreReply::Contents(vec![("raw".to_owned(), 1)]));
        match &replies[1] {
            StoreReply::Folded(totals) => assert_eq!(totals.get("true"), Some(&2)),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(replies[2], StoreReply::Removed(true));
        assert_eq!(replies[3], StoreReply::Removed(false));
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("bkt:t:*", "bkt:t:123"));
        assert!(glob_match("bkt:t:*", "bkt:t:"));
        assert!(!glob_match("bkt:t:*", "bkt:u:123"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("a*c", "abcbc"));
        assert!(!glob_match("a*c", "abbbd"));
        assert!(!glob_match("a*a", "a"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }
}
