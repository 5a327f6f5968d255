//! Time-bucketed event counting and top-k ranking over an ordered score
//! store. Events are sharded into fixed-duration buckets; reads answer
//! grouped counts per bucket and budgeted cross-bucket rankings without
//! scanning full history.

use std::time::Duration;

pub use crate::cache::{BucketCache, Snapshot};
pub use crate::engine::{Engine, Query, QueryRow};
pub use crate::error::{Error, Result};
pub use crate::event::{Aggregate, AttrValue, Attrs, Event, Outcome, DENIED_MARKER};
pub use crate::ranker::{RankEntry, Rankings};
pub use crate::store::{MemStore, ScoreStore, StoreOp, StoreReply};
pub use crate::window::{validate_table, BucketKey, TimestampMs, Window};

mod cache;
mod engine;
mod error;
mod event;
mod pipeline;
mod ranker;
mod store;
mod window;

#[derive(Clone)]
pub struct Config {
    /// Bucket duration.
    pub window: Window,
    /// Namespace prepended to every bucket key.
    pub prefix: String,
    /// Horizon past which buckets are evicted lazily during pattern-scanning
    /// reads. `None` (the default) keeps buckets forever. Eviction only
    /// happens on reads: a bucket that is never read again can outlive its
    /// horizon.
    pub retention: Option<Duration>,
    /// How long a bucket snapshot may be served from the local cache. Zero
    /// disables caching.
    pub cache_ttl: Duration,
    /// Maximum operations per pipelined store round trip.
    pub max_pipeline_size: usize,
    /// Default ranking scan budget as a multiple of the requested item
    /// count.
    pub check_at_most_factor: usize,
    /// Attribute holding the result-category discriminator.
    pub outcome_field: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: Window::default(),
            prefix: "bkt".to_owned(),
            retention: None,
            cache_ttl: Duration::from_secs(2),
            max_pipeline_size: 48,
            check_at_most_factor: 5,
            outcome_field: "allowed".to_owned(),
        }
    }
}
