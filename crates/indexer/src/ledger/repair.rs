//! One-shot correction of amounts written with the wrong fixed-point scale.
//!
//! Early ledger rows were normalized with 18 decimals although the collateral
//! token has 6, so every cost and volume they carry is `10^12` times too
//! small. No real trade costs less than a tenth of a cent, which makes
//! magnitude a reliable discriminator: any non-zero amount below
//! [`DEFAULT_THRESHOLD`] is scaled back up by `10^12`.
//!
//! The whole job is a single transaction. A row that cannot be parsed or
//! written aborts it and nothing is changed. A committed repair also rewinds
//! every cursor past the given checkpoint, so the following indexer run
//! revisits those blocks.

use fastnum::UD256;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::{cursor, db_amount, models::VolumeDrift, reconcile};
use crate::{error::IndexerError, num};

/// Amounts below this (and above zero) are considered mis-scaled.
pub const DEFAULT_THRESHOLD: &str = "0.001";

#[derive(Clone, Copy, Debug)]
pub struct RepairOptions {
    pub threshold: UD256,
    /// Power of ten applied to mis-scaled amounts.
    pub factor_exponent: i32,
    /// Cursors past this block are rewound to it after the correction.
    /// Required when committing.
    pub checkpoint: Option<u64>,
    /// Commit the transaction; otherwise everything is rolled back.
    pub confirm: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            threshold: num::pow10(-3),
            factor_exponent: num::SCALE_ERROR_EXPONENT,
            checkpoint: None,
            confirm: false,
        }
    }
}

/// A single rewritten amount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Correction {
    pub table: &'static str,
    /// `trades.id` or `market_aggregates.market_id`.
    pub key: i64,
    pub before: String,
    pub after: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub corrections: Vec<Correction>,
    /// Markets whose volume still disagreed with their trades after rescaling.
    pub drifts: Vec<VolumeDrift>,
    pub cursors_rewound: u64,
    pub committed: bool,
}

impl RepairReport {
    pub fn trades_rescaled(&self) -> usize {
        self.corrections.iter().filter(|c| c.table == "trades").count()
    }

    pub fn aggregates_rescaled(&self) -> usize {
        self.corrections.iter().filter(|c| c.table == "market_aggregates").count()
    }
}

fn is_misscaled(value: UD256, threshold: UD256) -> bool { !value.is_zero() && value < threshold }

/// Runs the repair; see the module documentation.
pub async fn repair(pool: &SqlitePool, options: &RepairOptions) -> Result<RepairReport, IndexerError> {
    if options.confirm && options.checkpoint.is_none() {
        return Err(IndexerError::InvalidArgument(
            "committing a repair needs a checkpoint to rewind the cursors to".to_string(),
        ));
    }
    let factor = num::pow10(options.factor_exponent);
    let mut report = RepairReport::default();
    let mut tx = pool.begin().await?;

    let trades: Vec<(i64, String, String)> =
        sqlx::query_as("SELECT id, shares, total_cost FROM trades ORDER BY id")
            .fetch_all(&mut *tx)
            .await?;
    for (id, shares, total_cost) in trades {
        let cost = db_amount(&total_cost, "trades", id)?;
        if !is_misscaled(cost, options.threshold) {
            continue;
        }
        let corrected = cost * factor;
        let price = num::price_per_share(corrected, db_amount(&shares, "trades", id)?);
        let after = num::to_canonical(corrected);
        sqlx::query("UPDATE trades SET total_cost = ?, price_per_share = ? WHERE id = ?")
            .bind(&after)
            .bind(num::to_canonical(price))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        report.corrections.push(Correction { table: "trades", key: id, before: total_cost, after });
    }

    let volumes: Vec<(i64, String)> =
        sqlx::query_as("SELECT market_id, volume FROM market_aggregates ORDER BY market_id")
            .fetch_all(&mut *tx)
            .await?;
    for (market, volume) in volumes {
        let value = db_amount(&volume, "market_aggregates", market)?;
        if !is_misscaled(value, options.threshold) {
            continue;
        }
        let after = num::to_canonical(value * factor);
        sqlx::query("UPDATE market_aggregates SET volume = ? WHERE market_id = ?")
            .bind(&after)
            .bind(market)
            .execute(&mut *tx)
            .await?;
        report.corrections.push(Correction {
            table: "market_aggregates",
            key: market,
            before: volume,
            after,
        });
    }

    report.drifts = reconcile(&mut tx).await?;
    if let Some(checkpoint) = options.checkpoint {
        report.cursors_rewound = cursor::rewind_all(&mut tx, checkpoint).await?;
    }

    if options.confirm {
        tx.commit().await?;
        report.committed = true;
        info!(
            trades = report.trades_rescaled(),
            aggregates = report.aggregates_rescaled(),
            reconciled = report.drifts.len(),
            cursors_rewound = report.cursors_rewound,
            "repair committed"
        );
    } else {
        tx.rollback().await?;
        warn!(
            trades = report.trades_rescaled(),
            aggregates = report.aggregates_rescaled(),
            "dry run, nothing written; pass confirmation to commit"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    async fn seed(ledger: &Ledger, sql: &str) {
        sqlx::query(sql).execute(ledger.pool()).await.unwrap();
    }

    async fn seed_scenario(ledger: &Ledger) {
        seed(
            ledger,
            "INSERT INTO trades (market_id, user_address, outcome_index, shares, total_cost, \
             price_per_share, tx_hash, block_number, created_at) VALUES \
             (4, '0xaa', 0, '1.0', '0.00000000000065', '0.00000000000065', '0x01', 100, 't'), \
             (5, '0xaa', 1, '2.0', '3.0', '1.5', '0x02', 101, 't'), \
             (6, '0xaa', 0, '0.0', '0.0', '0.0', '0x03', 102, 't')",
        )
        .await;
        seed(
            ledger,
            "INSERT INTO market_aggregates (market_id, volume, last_indexed_block) VALUES \
             (4, '0.00000000000065', 900), (5, '3.0', 50), (6, '0.0', NULL)",
        )
        .await;
    }

    #[test]
    fn threshold_matches_literal() {
        assert_eq!(num::to_canonical(RepairOptions::default().threshold), DEFAULT_THRESHOLD);
    }

    #[tokio::test]
    async fn rescales_and_reconciles() {
        let ledger = Ledger::in_memory().await.unwrap();
        seed_scenario(&ledger).await;

        let options = RepairOptions { checkpoint: Some(500), confirm: true, ..Default::default() };
        let report = repair(ledger.pool(), &options).await.unwrap();
        assert!(report.committed);
        assert_eq!(report.trades_rescaled(), 1);
        assert_eq!(report.aggregates_rescaled(), 1);
        assert!(report.drifts.is_empty());
        assert_eq!(report.cursors_rewound, 1);

        let trade = &ledger.trades(&Default::default()).await.unwrap()[0];
        assert_eq!(trade.total_cost, "0.65");
        assert_eq!(trade.price_per_share, "0.65");
        assert_eq!(ledger.aggregate(4).await.unwrap().unwrap().volume, "0.65");
        assert_eq!(ledger.aggregate(5).await.unwrap().unwrap().volume, "3.0");
        assert_eq!(ledger.cursor().get(4).await.unwrap(), Some(500));
        assert_eq!(ledger.cursor().get(5).await.unwrap(), Some(50));
        assert_eq!(ledger.cursor().get(6).await.unwrap(), None);

        // Second run finds nothing left to fix
        let again = repair(ledger.pool(), &options).await.unwrap();
        assert!(again.corrections.is_empty());
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let ledger = Ledger::in_memory().await.unwrap();
        seed_scenario(&ledger).await;

        let report = repair(ledger.pool(), &RepairOptions::default()).await.unwrap();
        assert!(!report.committed);
        assert_eq!(report.trades_rescaled(), 1);
        assert_eq!(ledger.aggregate(4).await.unwrap().unwrap().volume, "0.00000000000065");
    }

    #[tokio::test]
    async fn bad_row_rolls_back_everything() {
        let ledger = Ledger::in_memory().await.unwrap();
        seed_scenario(&ledger).await;
        seed(
            &ledger,
            "INSERT INTO trades (market_id, user_address, outcome_index, shares, total_cost, \
             price_per_share, tx_hash, block_number, created_at) VALUES \
             (7, '0xaa', 0, '1.0', 'garbage', '0.0', '0x04', 103, 't')",
        )
        .await;

        let options = RepairOptions { checkpoint: Some(0), confirm: true, ..Default::default() };
        assert!(matches!(repair(ledger.pool(), &options).await, Err(IndexerError::Decimal(_))));

        let trades = ledger.trades(&Default::default()).await.unwrap();
        assert_eq!(trades[0].total_cost, "0.00000000000065");
        assert_eq!(ledger.aggregate(4).await.unwrap().unwrap().volume, "0.00000000000065");
    }

    #[tokio::test]
    async fn commit_without_checkpoint_is_refused() {
        let ledger = Ledger::in_memory().await.unwrap();
        seed_scenario(&ledger).await;

        let options = RepairOptions { confirm: true, ..Default::default() };
        assert!(matches!(
            repair(ledger.pool(), &options).await,
            Err(IndexerError::InvalidArgument(_))
        ));
        assert_eq!(ledger.aggregate(4).await.unwrap().unwrap().volume, "0.00000000000065");
        assert_eq!(ledger.cursor().get(4).await.unwrap(), Some(900));
    }
}
