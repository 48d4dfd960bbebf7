use alloy::primitives::{Address, TxHash, U256};

use crate::num;

/// Trade decoded from a single AMM log, amounts still in raw fixed-point.
///
/// Decoding is deterministic: the same log delivered twice (retry,
/// overlapping ranges) yields equal events.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TradeEvent {
    /// Market the shares were bought in.
    pub market_id: super::MarketId,

    /// Buyer.
    pub user: Address,

    /// Outcome the shares belong to.
    pub outcome_index: super::OutcomeIndex,

    /// Shares minted, in share fixed-point.
    pub raw_shares: U256,

    /// Collateral paid, in collateral-token fixed-point.
    pub raw_cost: U256,

    /// Hash of the transaction that emitted the log; the trade's identity.
    pub tx_hash: TxHash,

    pub block_number: u64,

    /// Position of the log within its block.
    pub log_index: u64,
}

/// Trade ready to be persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedTrade {
    pub event: TradeEvent,
    pub amounts: num::Amounts,
}

impl NormalizedTrade {
    pub fn new(event: TradeEvent, normalizer: &num::Normalizer) -> Self {
        let amounts = normalizer.normalize(event.raw_shares, event.raw_cost);
        Self { event, amounts }
    }

    pub fn shares(&self) -> String { num::to_canonical(self.amounts.shares) }

    pub fn total_cost(&self) -> String { num::to_canonical(self.amounts.total_cost) }

    pub fn price_per_share(&self) -> String { num::to_canonical(self.amounts.price_per_share) }
}
