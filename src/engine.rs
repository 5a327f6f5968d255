//! The counting and ranking engine.
//!
//! [`Engine`] is generic over its [`ScoreStore`] backend. Ingestion writes
//! one atomic increment per event; reads go through the bucket cache, then
//! out in pipelined batches; pattern-scanning reads opportunistically evict
//! buckets past the retention horizon.

use std::sync::Arc;

use futures::future;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{self, BucketCache, Snapshot};
use crate::error::{Error, Result};
use crate::event::{Aggregate, Attrs, Event};
use crate::pipeline::dispatch_batched;
use crate::ranker::{select_top, Rankings};
use crate::store::{ScoreStore, StoreOp, StoreReply};
use crate::window::{now_ms, validate_table, BucketKey, TimestampMs};
use crate::Config;

/// A time-range read with optional equality filters and field projection.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Inclusive lower bound on event time, epoch ms.
    pub since: Option<TimestampMs>,
    /// Exclusive upper bound on event time, epoch ms.
    pub until: Option<TimestampMs>,
    /// Attribute equality filters; all must match.
    pub filters: Attrs,
    /// Attributes kept in returned rows; `None` keeps all.
    pub projection: Option<Vec<String>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, t: TimestampMs) -> Self {
        self.since = Some(t);
        self
    }

    pub fn until(mut self, t: TimestampMs) -> Self {
        self.until = Some(t);
        self
    }

    pub fn filter<V: Into<crate::event::AttrValue>>(mut self, key: &str, value: V) -> Self {
        self.filters.insert(key.to_owned(), value.into());
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| (*f).to_owned()).collect());
        self
    }
}

/// One counter row returned by [`Engine::query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    /// Inclusive start of the bucket the counter lives in, epoch ms.
    pub time: TimestampMs,
    pub attrs: Attrs,
    pub count: u64,
}

/// Time-bucketed counting and ranking over a [`ScoreStore`].
///
/// Constructed inside a tokio runtime: unless the cache TTL is zero, `new`
/// spawns the cache sweeper task, which is aborted again when the engine
/// drops.
pub struct Engine<S: ScoreStore> {
    store: Arc<S>,
    cfg: Arc<Config>,
    cache: Option<Arc<BucketCache>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl<S: ScoreStore> Engine<S> {
    pub fn new(store: S, cfg: Config) -> Self {
        let cfg = Arc::new(cfg);
        let (cache, sweeper) = if cfg.cache_ttl.is_zero() {
            (None, None)
        } else {
            let cache = Arc::new(BucketCache::new(cfg.cache_ttl));
            let sweeper = cache::spawn_sweeper(cache.clone(), cfg.cache_ttl);
            (Some(cache), Some(sweeper))
        };
        Self {
            store: Arc::new(store),
            cfg,
            cache,
            sweeper,
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    #[inline]
    pub fn store(&self) -> &S {
        self.store.as_ref()
    }

    #[inline]
    fn bucket_key(&self, table: &str, time_ms: TimestampMs) -> BucketKey {
        BucketKey::derive(&self.cfg.prefix, table, self.cfg.window, time_ms)
    }

    /// The `count` bucket keys ending at the bucket containing `newest_ms`,
    /// newest first.
    fn bucket_keys_back(&self, table: &str, newest_ms: TimestampMs, count: usize) -> Vec<BucketKey> {
        let size = self.cfg.window.size_ms();
        let newest = self.cfg.window.bucket_start(newest_ms);
        (0..count)
            .map(|i| BucketKey::new(&self.cfg.prefix, table, newest - size * i as i64))
            .collect()
    }

    /// Records `events` into `table`, one atomic increment per event.
    ///
    /// Events are independent: all increments are issued together and
    /// awaited together, and the first failure is returned only after every
    /// increment has settled, so unaffected events are already durably
    /// applied. No write is ever silently dropped.
    pub async fn ingest(&self, table: &str, events: &[Event]) -> Result<()> {
        validate_table(table)?;
        let mut futs = Vec::with_capacity(events.len());
        for ev in events {
            let member = ev.member()?;
            let at = ev.timestamp.unwrap_or_else(now_ms);
            let key = self.bucket_key(table, at).to_string();
            let store = self.store.clone();
            futs.push(async move { store.increment(&key, &member, 1).await });
        }
        let total = futs.len();
        let mut first_err = None;
        let mut applied = 0usize;
        for res in future::join_all(futs).await {
            match res {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!("ingest increment failed: {}", e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        debug!("ingest applied {}/{} event(s) to table {}", applied, total, table);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Folds one bucket's counters by `group_field` in a single atomic
    /// server-side operation. An absent bucket yields empty totals.
    pub async fn aggregate_bucket(
        &self,
        table: &str,
        group_field: &str,
        at: Option<TimestampMs>,
    ) -> Result<Aggregate> {
        validate_table(table)?;
        let key = self.bucket_key(table, at.unwrap_or_else(now_ms));
        let totals = self.store.fold(&key.to_string(), group_field).await?;
        Ok(Aggregate {
            time: key.start,
            field: group_field.to_owned(),
            totals,
        })
    }

    /// Aggregates `bucket_count` consecutive buckets walking backward from
    /// `at`, newest to oldest.
    ///
    /// Buckets aggregate serially; the first failing bucket aborts the
    /// remaining sequence.
    pub async fn aggregate_buckets(
        &self,
        table: &str,
        group_field: &str,
        bucket_count: usize,
        at: Option<TimestampMs>,
    ) -> Result<Vec<Aggregate>> {
        validate_table(table)?;
        let keys = self.bucket_keys_back(table, at.unwrap_or_else(now_ms), bucket_count);
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let totals = self.store.fold(&key.to_string(), group_field).await?;
            out.push(Aggregate {
                time: key.start,
                field: group_field.to_owned(),
                totals,
            });
        }
        Ok(out)
    }

    /// Same results and order as [`Engine::aggregate_buckets`], with the
    /// per-bucket folds batched into pipelined round trips of at most
    /// `max_pipeline_size`.
    pub async fn aggregate_buckets_with_pipeline(
        &self,
        table: &str,
        group_field: &str,
        bucket_count: usize,
        at: Option<TimestampMs>,
    ) -> Result<Vec<Aggregate>> {
        validate_table(table)?;
        let keys = self.bucket_keys_back(table, at.unwrap_or_else(now_ms), bucket_count);
        let ops = keys
            .iter()
            .map(|k| StoreOp::Fold {
                key: k.to_string(),
                field: group_field.to_owned(),
            })
            .collect();
        let replies = dispatch_batched(self.store.as_ref(), ops, self.cfg.max_pipeline_size).await?;
        keys.iter()
            .zip(replies)
            .map(|(key, reply)| match reply {
                StoreReply::Folded(totals) => Ok(Aggregate {
                    time: key.start,
                    field: group_field.to_owned(),
                    totals,
                }),
                other => Err(Error::Msg(format!("unexpected pipeline reply: {:?}", other))),
            })
            .collect()
    }

    /// Top `item_count` identifiers per result category across
    /// `timestamp_count` consecutive buckets ending at `at`.
    ///
    /// The cross-bucket score union is computed atomically by the store; the
    /// scan then examines at most `check_at_most` members (default
    /// `item_count x check_at_most_factor`), so sparse categories may come
    /// back short of `item_count`. That is a documented trade, not an error.
    pub async fn get_most_allowed_blocked(
        &self,
        table: &str,
        timestamp_count: usize,
        item_count: usize,
        at: Option<TimestampMs>,
        check_at_most: Option<usize>,
    ) -> Result<Rankings> {
        validate_table(table)?;
        let check_at_most = check_at_most
            .unwrap_or_else(|| item_count.saturating_mul(self.cfg.check_at_most_factor));
        let keys: Vec<String> = self
            .bucket_keys_back(table, at.unwrap_or_else(now_ms), timestamp_count)
            .iter()
            .map(ToString::to_string)
            .collect();
        let union = self.store.union(&keys).await?;
        debug!(
            "ranking table {}: {} member(s) unioned from {} bucket(s), budget {}",
            table,
            union.len(),
            keys.len(),
            check_at_most
        );
        Ok(select_top(&union, &self.cfg.outcome_field, item_count, check_at_most))
    }

    /// Sum of matching counter values across the queried range.
    pub async fn count(&self, table: &str, query: &Query) -> Result<u64> {
        let rows = self.query(table, query).await?;
        Ok(rows.iter().map(|r| r.count).sum())
    }

    /// Matching counters per bucket across the queried range, oldest bucket
    /// first.
    ///
    /// Buckets are enumerated by pattern scan, which makes this a
    /// retention-evicting read; contents come through the bucket cache, with
    /// misses batch-fetched from the store.
    pub async fn query(&self, table: &str, query: &Query) -> Result<Vec<QueryRow>> {
        validate_table(table)?;
        let buckets = self.scan_live_buckets(table).await?;
        let size = self.cfg.window.size_ms();
        let in_range: Vec<BucketKey> = buckets
            .into_iter()
            .filter(|k| {
                query.until.map_or(true, |until| k.start < until)
                    && query.since.map_or(true, |since| k.start + size > since)
            })
            .collect();
        let snapshots = self.fetch_buckets(&in_range).await?;

        let mut rows = Vec::new();
        for (key, snapshot) in in_range.iter().zip(snapshots) {
            for (member, count) in snapshot.iter() {
                let attrs = match Event::parse_member(member) {
                    Ok(attrs) => attrs,
                    Err(e) => {
                        warn!("skipping unparsable member {:?}: {}", member, e);
                        continue;
                    }
                };
                if !matches_filters(&attrs, &query.filters) {
                    continue;
                }
                rows.push(QueryRow {
                    time: key.start,
                    attrs: project(attrs, query.projection.as_deref()),
                    count: *count,
                });
            }
        }
        Ok(rows)
    }

    /// Enumerates `table`'s buckets by pattern, evicting any discovered
    /// bucket past the retention horizon before returning the survivors in
    /// ascending time order.
    ///
    /// Eviction is lazy: with retention disabled (the default), or for
    /// buckets no pattern-scanning read ever touches again, nothing is
    /// reclaimed.
    async fn scan_live_buckets(&self, table: &str) -> Result<Vec<BucketKey>> {
        let pattern = format!("{}:{}:*", self.cfg.prefix, table);
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.store.scan(&pattern, cursor).await?;
            for raw in page {
                match BucketKey::parse(&raw) {
                    Ok(key) => keys.push(key),
                    Err(e) => warn!("skipping malformed bucket key {:?}: {}", raw, e),
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if let Some(retention) = self.cfg.retention {
            let horizon = now_ms() - retention.as_millis() as i64;
            let (expired, live): (Vec<BucketKey>, Vec<BucketKey>) =
                keys.into_iter().partition(|k| k.start < horizon);
            if !expired.is_empty() {
                info!(
                    "evicting {} expired bucket(s) from table {}",
                    expired.len(),
                    table
                );
                let ops = expired.iter().map(|k| StoreOp::Remove(k.to_string())).collect();
                dispatch_batched(self.store.as_ref(), ops, self.cfg.max_pipeline_size).await?;
                if let Some(cache) = &self.cache {
                    for key in &expired {
                        cache.invalidate(&key.to_string());
                    }
                }
            }
            keys = live;
        }

        keys.sort_by_key(|k| k.start);
        Ok(keys)
    }

    /// Bucket contents for `keys`, served from the cache where fresh; all
    /// misses go out as one batched fetch and are cached on the way back.
    async fn fetch_buckets(&self, keys: &[BucketKey]) -> Result<Vec<Snapshot>> {
        let mut found: Vec<Option<Snapshot>> = vec![None; keys.len()];
        let mut misses = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let raw = key.to_string();
            if let Some(cache) = &self.cache {
                if let Some(snapshot) = cache.get(&raw) {
                    debug!("cache hit for {}", raw);
                    found[i] = Some(snapshot);
                    continue;
                }
            }
            misses.push(i);
        }

        if !misses.is_empty() {
            let ops = misses
                .iter()
                .map(|&i| StoreOp::Fetch(keys[i].to_string()))
                .collect();
            let replies = dispatch_batched(self.store.as_ref(), ops, self.cfg.max_pipeline_size).await?;
            for (&i, reply) in misses.iter().zip(replies) {
                let contents = match reply {
                    StoreReply::Contents(contents) => contents,
                    other => {
                        return Err(Error::Msg(format!("unexpected pipeline reply: {:?}", other)))
                    }
                };
                let snapshot: Snapshot = Arc::new(contents);
                if let Some(cache) = &self.cache {
                    cache.put(keys[i].to_string(), snapshot.clone());
                }
                found[i] = Some(snapshot);
            }
        }

        found
            .into_iter()
            .map(|s| s.ok_or_else(|| Error::Msg("bucket snapshot missing".into())))
            .collect()
    }
}

impl<S: ScoreStore> Drop for Engine<S> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn matches_filters(attrs: &Attrs, filters: &Attrs) -> bool {
    filters.iter().all(|(k, v)| attrs.get(k) == Some(v))
}

fn project(mut attrs: Attrs, projection: Option<&[String]>) -> Attrs {
    if let Some(fields) = projection {
        attrs.retain(|k, _| fields.iter().any(|f| f == k));
    }
    attrs
}
