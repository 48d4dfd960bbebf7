//! Splitting a block interval into chunks and handing them out to workers.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    error::IndexerError,
    types::{Chunk, ScanOrder},
};

/// Most chunks a single scan is split into.
pub const MAX_CHUNKS: u64 = 1 << 24;

/// Splits `[start, current]` into contiguous chunks of at most `chunk_size`
/// blocks.
///
/// The result covers every block of the interval exactly once, in ascending
/// order unless `order` asks for the most recent blocks first. An interval
/// with `start > current` yields no chunks; one needing more than
/// [`MAX_CHUNKS`] chunks is refused.
pub fn partition(
    start: u64,
    current: u64,
    chunk_size: u64,
    order: ScanOrder,
) -> Result<Vec<Chunk>, IndexerError> {
    if chunk_size == 0 {
        return Err(IndexerError::InvalidArgument("chunk size must be positive".to_string()));
    }
    if start > current {
        return Ok(Vec::new());
    }

    let count = ((current - start) / chunk_size)
        .checked_add(1)
        .filter(|count| *count <= MAX_CHUNKS)
        .ok_or_else(|| {
            IndexerError::InvalidArgument(format!(
                "blocks {start}..={current} need more than {MAX_CHUNKS} chunks of {chunk_size} \
                 blocks"
            ))
        })?;
    let mut chunks = Vec::with_capacity(count as usize);
    let mut from = start;
    loop {
        let to = from.saturating_add(chunk_size - 1).min(current);
        chunks.push(Chunk::new(from, to));
        if to == current {
            break;
        }
        from = to + 1;
    }

    if order == ScanOrder::MostRecentFirst {
        chunks.reverse();
    }
    Ok(chunks)
}

/// Work queue shared by the chunk workers.
///
/// Chunks are claimed through a single atomic cursor. A chunk a worker gave
/// up on may be put back with [`Self::requeue`]; requeued chunks are served
/// before the remaining fresh ones. The queue is drained once every chunk has
/// been reported [`Self::complete`].
#[derive(Debug)]
pub struct ChunkQueue {
    chunks: Vec<Chunk>,
    next: AtomicUsize,
    requeued: Mutex<VecDeque<Chunk>>,
    outstanding: AtomicUsize,
}

impl ChunkQueue {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        let outstanding = AtomicUsize::new(chunks.len());
        Self { chunks, next: AtomicUsize::new(0), requeued: Mutex::new(VecDeque::new()), outstanding }
    }

    /// Total number of chunks the queue was created with.
    pub fn len(&self) -> usize { self.chunks.len() }

    pub fn is_empty(&self) -> bool { self.chunks.is_empty() }

    /// Claims the next chunk, if any is immediately available.
    pub fn claim(&self) -> Option<Chunk> {
        if let Some(chunk) = self.lock_requeued().pop_front() {
            return Some(chunk);
        }
        let idx = self.next.fetch_add(1, Ordering::AcqRel);
        self.chunks.get(idx).copied()
    }

    /// Puts a claimed chunk back to be attempted again.
    pub fn requeue(&self, chunk: Chunk) { self.lock_requeued().push_back(chunk); }

    /// Marks a claimed chunk as finished, whether committed or skipped.
    pub fn complete(&self) {
        let _ = self.outstanding.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Chunks not yet completed, including claimed ones still in flight.
    pub fn outstanding(&self) -> usize { self.outstanding.load(Ordering::Acquire) }

    pub fn is_drained(&self) -> bool { self.outstanding() == 0 }

    fn lock_requeued(&self) -> std::sync::MutexGuard<'_, VecDeque<Chunk>> {
        // The guarded deque has no invariant a panicking holder could break
        self.requeued.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
