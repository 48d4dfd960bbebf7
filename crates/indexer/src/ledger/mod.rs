//! Relational copy of on-chain trades.
//!
//! Two tables: `trades`, one row per trade keyed by transaction hash, and
//! `market_aggregates`, holding each market's volume and indexing progress.
//! Writes go through a single [`writer::LedgerWriter`] task; reads may use
//! any connection of the pool.

pub mod cursor;
mod models;
pub mod repair;
pub mod writer;

use std::{collections::BTreeMap, str::FromStr};

use fastnum::UD256;
pub use models::*;
use sqlx::{
    QueryBuilder, Sqlite, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tracing::{info, warn};

use crate::{error::IndexerError, num, types};

const TRADE_COLUMNS: &str = "id, market_id, user_address, outcome_index, shares, total_cost, \
                             price_per_share, tx_hash, block_number, log_index, created_at";

/// Handle to the ledger database.
#[derive(Clone, Debug)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Opens (creating if missing) the database at `url` and applies pending
    /// migrations.
    pub async fn connect(url: &str) -> Result<Self, IndexerError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let ledger = Self::from_pool(pool);
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// In-memory database, one connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        let ledger = Self::from_pool(pool);
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub fn from_pool(pool: SqlitePool) -> Self { Self { pool } }

    pub async fn migrate(&self) -> Result<(), IndexerError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool { &self.pool }

    pub fn cursor(&self) -> cursor::ProgressCursor { cursor::ProgressCursor::new(self.pool.clone()) }

    /// Trades matching the query, oldest block first.
    pub async fn trades(&self, query: &TradeQuery) -> Result<Vec<TradeRow>, IndexerError> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {TRADE_COLUMNS} FROM trades WHERE 1 = 1"));
        if let Some(market) = query.market {
            qb.push(" AND market_id = ").push_bind(db_int(market, "market id")?);
        }
        if let Some(user) = query.user {
            qb.push(" AND user_address = ").push_bind(db_address(user));
        }
        if let Some(since) = query.since {
            qb.push(" AND created_at >= ").push_bind(db_timestamp(since));
        }
        if let Some(until) = query.until {
            qb.push(" AND created_at < ").push_bind(db_timestamp(until));
        }
        qb.push(" ORDER BY block_number, log_index, id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }
        Ok(qb.build_query_as::<TradeRow>().fetch_all(&self.pool).await?)
    }

    pub async fn trade_count(&self) -> Result<u64, IndexerError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades").fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    pub async fn aggregate(
        &self,
        market: types::MarketId,
    ) -> Result<Option<AggregateRow>, IndexerError> {
        Ok(sqlx::query_as::<_, AggregateRow>(
            "SELECT market_id, volume, last_indexed_block FROM market_aggregates WHERE market_id = ?",
        )
        .bind(db_int(market, "market id")?)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn aggregates(&self) -> Result<Vec<AggregateRow>, IndexerError> {
        Ok(sqlx::query_as::<_, AggregateRow>(
            "SELECT market_id, volume, last_indexed_block FROM market_aggregates ORDER BY market_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Rebuilds a market's volume as the sum of its trades' costs and returns
    /// it in canonical form.
    pub async fn recompute_volume(&self, market: types::MarketId) -> Result<String, IndexerError> {
        let market = db_int(market, "market id")?;
        let mut tx = self.pool.begin().await?;
        let volume = num::to_canonical(sum_total_cost(&mut tx, market).await?);
        store_volume(&mut tx, market, &volume).await?;
        tx.commit().await?;
        Ok(volume)
    }

    /// Recomputes every market's volume from its trades, returning the
    /// markets whose stored volume was off.
    pub async fn reconcile_volumes(&self) -> Result<Vec<VolumeDrift>, IndexerError> {
        let mut tx = self.pool.begin().await?;
        let drifts = reconcile(&mut tx).await?;
        tx.commit().await?;
        if drifts.is_empty() {
            info!("market volumes consistent with trades");
        } else {
            warn!(markets = drifts.len(), "market volumes reconciled");
        }
        Ok(drifts)
    }
}

/// `SUM(total_cost)` of a market, computed in exact decimal arithmetic.
pub(crate) async fn sum_total_cost(
    conn: &mut SqliteConnection,
    market: i64,
) -> Result<UD256, IndexerError> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, total_cost FROM trades WHERE market_id = ?")
            .bind(market)
            .fetch_all(&mut *conn)
            .await?;
    rows.iter().try_fold(UD256::ZERO, |acc, (id, cost)| {
        Ok(acc + db_amount(cost, "trades", *id)?)
    })
}

pub(crate) async fn store_volume(
    conn: &mut SqliteConnection,
    market: i64,
    volume: &str,
) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO market_aggregates (market_id, volume) VALUES (?, ?) \
         ON CONFLICT(market_id) DO UPDATE SET volume = excluded.volume",
    )
    .bind(market)
    .bind(volume)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Sets every market's volume to the sum of its trades.
pub(crate) async fn reconcile(conn: &mut SqliteConnection) -> Result<Vec<VolumeDrift>, IndexerError> {
    let costs: Vec<(i64, i64, String)> =
        sqlx::query_as("SELECT id, market_id, total_cost FROM trades")
            .fetch_all(&mut *conn)
            .await?;
    let mut actual = BTreeMap::<i64, UD256>::new();
    for (id, market, cost) in &costs {
        let sum = actual.entry(*market).or_insert(UD256::ZERO);
        *sum = *sum + db_amount(cost, "trades", *id)?;
    }

    let stored: BTreeMap<i64, String> =
        sqlx::query_as::<_, (i64, String)>("SELECT market_id, volume FROM market_aggregates")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();
    for market in stored.keys() {
        actual.entry(*market).or_insert(UD256::ZERO);
    }

    let mut drifts = Vec::new();
    for (market, sum) in actual {
        let actual = num::to_canonical(sum);
        let stored = stored.get(&market);
        let consistent = match stored {
            Some(volume) => {
                num::to_canonical(db_amount(volume, "market_aggregates", market)?) == actual
            },
            None => false,
        };
        if !consistent {
            store_volume(conn, market, &actual).await?;
            drifts.push(VolumeDrift {
                market_id: market as types::MarketId,
                stored: stored.cloned(),
                actual,
            });
        }
    }
    Ok(drifts)
}
