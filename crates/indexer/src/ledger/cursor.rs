use std::collections::BTreeMap;

use sqlx::{SqliteConnection, SqlitePool};

use super::models::db_int;
use crate::{
    error::IndexerError,
    types::{self, Chunk},
};

/// Per-market "last indexed block" store.
///
/// Lives in `market_aggregates.last_indexed_block`; `NULL` means the market
/// was never indexed.
#[derive(Clone, Debug)]
pub struct ProgressCursor {
    pool: SqlitePool,
}

impl ProgressCursor {
    pub fn new(pool: SqlitePool) -> Self { Self { pool } }

    pub async fn get(&self, market: types::MarketId) -> Result<Option<u64>, IndexerError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT last_indexed_block FROM market_aggregates WHERE market_id = ?")
                .bind(db_int(market, "market id")?)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(block,)| block).map(|block| block as u64))
    }

    /// Moves the cursor forward to `block`; never moves it backward.
    pub async fn advance(&self, market: types::MarketId, block: u64) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO market_aggregates (market_id, last_indexed_block) VALUES (?, ?) \
             ON CONFLICT(market_id) DO UPDATE SET last_indexed_block = \
             MAX(COALESCE(last_indexed_block, excluded.last_indexed_block), \
                 excluded.last_indexed_block)",
        )
        .bind(db_int(market, "market id")?)
        .bind(db_int(block, "block number")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets the cursors of the given markets to `block`, in either direction.
    pub async fn reset(&self, markets: &[types::MarketId], block: u64) -> Result<(), IndexerError> {
        let block = db_int(block, "block number")?;
        let mut tx = self.pool.begin().await?;
        for market in markets {
            sqlx::query(
                "INSERT INTO market_aggregates (market_id, last_indexed_block) VALUES (?, ?) \
                 ON CONFLICT(market_id) DO UPDATE SET last_indexed_block = excluded.last_indexed_block",
            )
            .bind(db_int(*market, "market id")?)
            .bind(block)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Rewinds every cursor beyond `checkpoint` to it, returning how many moved.
pub(crate) async fn rewind_all(
    conn: &mut SqliteConnection,
    checkpoint: u64,
) -> Result<u64, IndexerError> {
    let result = sqlx::query(
        "UPDATE market_aggregates SET last_indexed_block = ? WHERE last_indexed_block > ?",
    )
    .bind(db_int(checkpoint, "checkpoint")?)
    .bind(db_int(checkpoint, "checkpoint")?)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Highest block below which every block of a scan has been committed.
///
/// Chunks complete in any order; the watermark only moves over a contiguous
/// prefix starting at the scan's first block, so a cursor driven by it never
/// skips a chunk that failed or is still in flight.
#[derive(Debug)]
pub struct Watermark {
    next_from: u64,
    high: Option<u64>,
    pending: BTreeMap<u64, u64>,
}

impl Watermark {
    /// Watermark of a scan starting at `start`.
    pub fn new(start: u64) -> Self { Self { next_from: start, high: None, pending: BTreeMap::new() } }

    /// Records a committed chunk and returns the new watermark if it moved.
    pub fn commit(&mut self, chunk: Chunk) -> Option<u64> {
        if chunk.to() < self.next_from {
            return None;
        }
        self.pending.insert(chunk.from(), chunk.to());
        let before = self.high;
        while let Some(to) = self.pending.remove(&self.next_from) {
            self.high = Some(to);
            match to.checked_add(1) {
                Some(next) => self.next_from = next,
                None => break,
            }
        }
        (self.high != before).then_some(self.high).flatten()
    }

    /// Last block of the contiguous committed prefix.
    pub fn get(&self) -> Option<u64> { self.high }
}
