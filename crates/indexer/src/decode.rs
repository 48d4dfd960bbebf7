use alloy::{
    primitives::{B256, U256},
    rpc::types::Log,
};
use alloy_sol_types::SolEvent;
use itertools::Itertools;

use crate::{
    abi::{SharesPurchased, TradeExecuted},
    error::IndexerError,
    types,
};

/// One historical layout of the AMM purchase event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Schema {
    /// `SharesPurchased(uint256 indexed,address indexed,uint256,uint256,uint256)`
    SharesPurchased,
    /// `TradeExecuted(uint256 indexed,address,uint8,uint256,uint256)`
    TradeExecuted,
}

impl Schema {
    /// All known layouts, most recent first.
    pub const ALL: [Schema; 2] = [Schema::SharesPurchased, Schema::TradeExecuted];

    pub fn signature(&self) -> &'static str {
        match self {
            Schema::SharesPurchased => SharesPurchased::SIGNATURE,
            Schema::TradeExecuted => TradeExecuted::SIGNATURE,
        }
    }

    /// Topic-0 of logs emitted with this layout.
    pub fn signature_hash(&self) -> B256 {
        match self {
            Schema::SharesPurchased => SharesPurchased::SIGNATURE_HASH,
            Schema::TradeExecuted => TradeExecuted::SIGNATURE_HASH,
        }
    }

    /// Topic-0 plus indexed arguments.
    fn topic_count(&self) -> usize {
        match self {
            Schema::SharesPurchased => 3,
            Schema::TradeExecuted => 2,
        }
    }

    /// All non-indexed arguments are static words.
    fn data_len(&self) -> usize {
        match self {
            Schema::SharesPurchased => 3 * 32,
            Schema::TradeExecuted => 4 * 32,
        }
    }

    fn decode(&self, log: &Log) -> Result<types::TradeEvent, String> {
        let topics = log.topics();
        let data = &log.data().data;
        if topics.first() != Some(&self.signature_hash()) {
            return Err(format!("{}: signature mismatch", self.signature()));
        }
        if topics.len() != self.topic_count() {
            return Err(format!(
                "{}: expected {} topics, got {}",
                self.signature(),
                self.topic_count(),
                topics.len()
            ));
        }
        if data.len() != self.data_len() {
            return Err(format!(
                "{}: expected {} data bytes, got {}",
                self.signature(),
                self.data_len(),
                data.len()
            ));
        }

        let (tx_hash, block_number) = match (log.transaction_hash, log.block_number) {
            (Some(tx_hash), Some(block_number)) => (tx_hash, block_number),
            _ => return Err("log is pending: no transaction hash or block number".to_string()),
        };
        let log_index = log.log_index.unwrap_or_default();

        match self {
            Schema::SharesPurchased => {
                let e = SharesPurchased::decode_raw_log_validate(topics.iter().copied(), data)
                    .map_err(|e| format!("{}: {}", self.signature(), e))?;
                Ok(types::TradeEvent {
                    market_id: market_id(e.marketId)?,
                    user: e.buyer,
                    outcome_index: u64::try_from(e.outcomeIndex)
                        .map_err(|_| format!("outcome index {} out of range", e.outcomeIndex))?,
                    raw_shares: e.shares,
                    raw_cost: e.totalCost,
                    tx_hash,
                    block_number,
                    log_index,
                })
            },
            Schema::TradeExecuted => {
                let e = TradeExecuted::decode_raw_log_validate(topics.iter().copied(), data)
                    .map_err(|e| format!("{}: {}", self.signature(), e))?;
                Ok(types::TradeEvent {
                    market_id: market_id(e.marketId)?,
                    user: e.buyer,
                    outcome_index: u64::from(e.outcome),
                    raw_shares: e.shares,
                    raw_cost: e.cost,
                    tx_hash,
                    block_number,
                    log_index,
                })
            },
        }
    }
}

fn market_id(raw: U256) -> Result<types::MarketId, String> {
    types::MarketId::try_from(raw).map_err(|_| format!("market id {} out of range", raw))
}

/// Decodes AMM logs into [`types::TradeEvent`]s by trying each configured
/// [`Schema`] in order.
#[derive(Clone, Debug)]
pub struct Decoder {
    schemas: Vec<Schema>,
}

impl Default for Decoder {
    fn default() -> Self { Self { schemas: Schema::ALL.to_vec() } }
}

impl Decoder {
    /// Topic-0 values to filter logs by.
    pub fn signature_hashes(&self) -> Vec<B256> {
        self.schemas.iter().map(Schema::signature_hash).collect()
    }

    /// Decodes a single log; the first schema that accepts it wins.
    pub fn decode(&self, log: &Log) -> Result<types::TradeEvent, IndexerError> {
        let tx_hash = log.transaction_hash.map(|h| h.to_string()).unwrap_or_default();
        if log.removed {
            return Err(IndexerError::MalformedLog {
                tx_hash,
                reason: "log was removed by a reorg".to_string(),
            });
        }

        let mut reasons = Vec::with_capacity(self.schemas.len());
        for schema in &self.schemas {
            match schema.decode(log) {
                Ok(event) => return Ok(event),
                Err(reason) => reasons.push(reason),
            }
        }
        Err(IndexerError::MalformedLog { tx_hash, reason: reasons.into_iter().join("; ") })
    }
}
