use std::collections::BTreeMap;

use chrono::Utc;
use fastnum::UD256;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::models::{db_address, db_int, db_timestamp, db_tx_hash};
use crate::{error::IndexerError, num, types};

/// Result of committing one batch of trades.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Rows created.
    pub inserted: usize,
    /// Trades whose transaction hash was already present; silently ignored.
    pub duplicates: usize,
}

impl std::ops::AddAssign for CommitOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.duplicates += rhs.duplicates;
    }
}

/// Inserts trades and bumps the owning markets' volumes on the given
/// connection, typically inside a transaction.
///
/// A trade whose transaction hash already exists is a no-op: no row, no
/// volume change.
pub async fn insert_trades(
    conn: &mut SqliteConnection,
    trades: &[types::NormalizedTrade],
) -> Result<CommitOutcome, IndexerError> {
    let created_at = db_timestamp(Utc::now());
    let mut outcome = CommitOutcome::default();
    let mut volume_deltas = BTreeMap::<i64, UD256>::new();

    for trade in trades {
        let event = &trade.event;
        let market = db_int(event.market_id, "market id")?;
        let result = sqlx::query(
            "INSERT INTO trades (market_id, user_address, outcome_index, shares, total_cost, \
             price_per_share, tx_hash, block_number, log_index, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tx_hash) DO NOTHING",
        )
        .bind(market)
        .bind(db_address(event.user))
        .bind(db_int(event.outcome_index, "outcome index")?)
        .bind(trade.shares())
        .bind(trade.total_cost())
        .bind(trade.price_per_share())
        .bind(db_tx_hash(event.tx_hash))
        .bind(db_int(event.block_number, "block number")?)
        .bind(db_int(event.log_index, "log index")?)
        .bind(&created_at)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 1 {
            outcome.inserted += 1;
            let delta = volume_deltas.entry(market).or_insert(UD256::ZERO);
            *delta = *delta + trade.amounts.total_cost;
        } else {
            outcome.duplicates += 1;
            debug!(tx_hash = %event.tx_hash, "trade already recorded");
        }
    }

    for (market, delta) in volume_deltas {
        let stored: Option<(String,)> =
            sqlx::query_as("SELECT volume FROM market_aggregates WHERE market_id = ?")
                .bind(market)
                .fetch_optional(&mut *conn)
                .await?;
        let current = match stored {
            Some((volume,)) => super::db_amount(&volume, "market_aggregates", market)?,
            None => UD256::ZERO,
        };
        super::store_volume(conn, market, &num::to_canonical(current + delta)).await?;
    }

    Ok(outcome)
}

/// Commits a batch in its own transaction.
pub async fn commit_batch(
    pool: &SqlitePool,
    trades: &[types::NormalizedTrade],
) -> Result<CommitOutcome, IndexerError> {
    let mut tx = pool.begin().await?;
    let outcome = insert_trades(&mut tx, trades).await?;
    tx.commit().await?;
    Ok(outcome)
}

struct WriteRequest {
    chunk: Option<types::Chunk>,
    trades: Vec<types::NormalizedTrade>,
    reply: oneshot::Sender<Result<CommitOutcome, IndexerError>>,
}

/// Sole writer of the ledger tables.
///
/// Runs as one task; batches arrive through [`WriterHandle`]s and are
/// committed one at a time, so SQLite never sees concurrent writers.
pub struct LedgerWriter {
    pool: SqlitePool,
    requests: mpsc::Receiver<WriteRequest>,
}

/// Cloneable sender side of a [`LedgerWriter`].
#[derive(Clone, Debug)]
pub struct WriterHandle {
    requests: mpsc::Sender<WriteRequest>,
}

impl LedgerWriter {
    pub fn new(pool: SqlitePool, capacity: usize) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { pool, requests: rx }, WriterHandle { requests: tx })
    }

    /// Runs until every [`WriterHandle`] is dropped.
    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            let result = commit_batch(&self.pool, &request.trades).await;
            match (&result, request.chunk) {
                (Ok(outcome), Some(chunk)) => debug!(
                    chunk_from = chunk.from(),
                    chunk_to = chunk.to(),
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    "batch committed"
                ),
                (Ok(_), None) => {},
                (Err(err), _) => error!(error = %err, "ledger write failed"),
            }
            // The requester may have given up waiting
            let _ = request.reply.send(result);
        }
    }

    /// Spawns [`Self::run`] on the current runtime.
    pub fn spawn(pool: SqlitePool, capacity: usize) -> (WriterHandle, tokio::task::JoinHandle<()>) {
        let (writer, handle) = Self::new(pool, capacity);
        (handle, tokio::spawn(writer.run()))
    }
}

impl WriterHandle {
    /// Sends a batch to the writer and waits until it is durably committed.
    pub async fn commit(
        &self,
        chunk: Option<types::Chunk>,
        trades: Vec<types::NormalizedTrade>,
    ) -> Result<CommitOutcome, IndexerError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(WriteRequest { chunk, trades, reply })
            .await
            .map_err(|_| IndexerError::Shutdown)?;
        response.await.map_err(|_| IndexerError::Shutdown)?
    }
}
