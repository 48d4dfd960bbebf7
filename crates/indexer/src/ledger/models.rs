//! Row types of the ledger tables.

use alloy::primitives::{Address, TxHash};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::{error::IndexerError, num, types};

/// Row of the `trades` table.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct TradeRow {
    pub id: i64,
    pub market_id: i64,
    pub user_address: String,
    pub outcome_index: i64,
    pub shares: String,
    pub total_cost: String,
    pub price_per_share: String,
    pub tx_hash: String,
    pub block_number: i64,
    pub log_index: i64,
    pub created_at: String,
}

impl TradeRow {
    /// Display label of the outcome for binary markets.
    pub fn outcome_label(&self) -> Option<&'static str> {
        types::outcome_label(self.outcome_index as types::OutcomeIndex, 2)
    }
}

/// Row of the `market_aggregates` table.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct AggregateRow {
    pub market_id: i64,
    pub volume: String,
    pub last_indexed_block: Option<i64>,
}

/// Stored volume of a market that did not match the sum of its trades.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeDrift {
    pub market_id: types::MarketId,
    /// Volume before reconciliation, `None` when the aggregate row was missing.
    pub stored: Option<String>,
    pub actual: String,
}

/// Filter of [`super::Ledger::trades`]; unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TradeQuery {
    pub market: Option<types::MarketId>,
    pub user: Option<Address>,
    /// Inclusive lower bound of `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound of `created_at`.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[cfg(feature = "display")]
impl tabled::Tabled for TradeRow {
    const LENGTH: usize = 8;

    fn fields(&self) -> Vec<std::borrow::Cow<'_, str>> {
        use colored::Colorize;

        let outcome = match self.outcome_label() {
            Some(label) => format!("{} ({label})", self.outcome_index),
            None => self.outcome_index.to_string(),
        };
        vec![
            self.block_number.to_string().into(),
            self.market_id.to_string().into(),
            self.user_address.as_str().into(),
            outcome.into(),
            self.shares.as_str().into(),
            self.total_cost.green().to_string().into(),
            self.price_per_share.as_str().into(),
            self.tx_hash.as_str().into(),
        ]
    }

    fn headers() -> Vec<std::borrow::Cow<'static, str>> {
        ["Block", "Market", "User", "Outcome", "Shares", "Cost", "Price", "Tx"]
            .into_iter()
            .map(Into::into)
            .collect()
    }
}

#[cfg(feature = "display")]
impl tabled::Tabled for AggregateRow {
    const LENGTH: usize = 3;

    fn fields(&self) -> Vec<std::borrow::Cow<'_, str>> {
        vec![
            self.market_id.to_string().into(),
            self.volume.as_str().into(),
            self.last_indexed_block.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string()).into(),
        ]
    }

    fn headers() -> Vec<std::borrow::Cow<'static, str>> {
        ["Market", "Volume", "Last indexed block"].into_iter().map(Into::into).collect()
    }
}

/// SQLite stores integers as signed 64-bit.
pub(crate) fn db_int(value: u64, what: &str) -> Result<i64, IndexerError> {
    i64::try_from(value)
        .map_err(|_| IndexerError::InvalidArgument(format!("{what} {value} exceeds i64::MAX")))
}

pub(crate) fn db_address(address: Address) -> String { format!("{address:#x}") }

pub(crate) fn db_tx_hash(tx_hash: TxHash) -> String { format!("{tx_hash:#x}") }

pub(crate) fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored amount, naming the offending row on failure.
pub(crate) fn db_amount(value: &str, table: &str, key: i64) -> Result<fastnum::UD256, IndexerError> {
    num::parse(value).map_err(|e| IndexerError::Decimal(format!("{table} row {key}: {e}")))
}
