//! Batched dispatch of independent bucket operations.

use log::trace;

use crate::error::Result;
use crate::store::{ScoreStore, StoreOp, StoreReply};

/// Dispatches `ops` as pipelined batches of at most `max_batch`.
///
/// Batches go out strictly one after another; within a batch the store sees
/// every operation in one round trip. Replies concatenate in submission
/// order, so reply `i` always answers op `i`. A failing batch fails the
/// whole call.
pub(crate) async fn dispatch_batched<S: ScoreStore + ?Sized>(
    store: &S,
    ops: Vec<StoreOp>,
    max_batch: usize,
) -> Result<Vec<StoreReply>> {
    let max_batch = max_batch.max(1);
    let mut replies = Vec::with_capacity(ops.len());
    for (n, chunk) in ops.chunks(max_batch).enumerate() {
        trace!("dispatching batch {} ({} op(s))", n, chunk.len());
        let mut batch = store.pipeline(chunk).await?;
        replies.append(&mut batch);
    }
    Ok(replies)
}
