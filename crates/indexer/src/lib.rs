//! Prediction-market AMM trade indexer.
//!
//! # Overview
//!
//! Scans blocks for the AMM's purchase events, decodes and normalizes them,
//! and keeps an idempotent relational copy of every trade along with
//! per-market volume and indexing progress.
//!
//! Use [`pipeline::Indexer::backfill`] for a bounded historical scan and
//! [`pipeline::Indexer::run_continuous`] to follow the chain from the stored
//! cursors. [`ledger::repair`] corrects rows written with the wrong
//! collateral scale.
//!
//! Data flow of a scan:
//!
//! [`partition`] -> [`worker`] (through [`endpoint::EndpointPool`]) ->
//! [`decode`] -> [`num`] -> [`ledger::writer`] -> [`ledger::cursor`].
//!
//! # Limitations/follow-ups
//!
//! * Reorgs deeper than the configured confirmations are not rolled back;
//!   removed logs are only rejected when the node flags them.
//!
//! * The trade's timestamp is the time it was indexed, not the block time.
//!
//! # Features
//!
//! | Feature | Default | Description |
//! | --- | --- | --- |
//! | `display` | yes | Enables [`std::fmt::Display`]/[`tabled::Tabled`] for ledger rows and run summaries. |
//! | `testing` | yes | Enables [`testing`] module. |

pub mod abi;
pub mod decode;
pub mod endpoint;
pub mod error;
pub mod ledger;
pub mod num;
pub mod partition;
pub mod pipeline;
pub mod retry;
#[cfg(feature = "testing")]
pub mod testing;
pub mod types;
pub mod worker;

use alloy::primitives::Address;
use tracing::info;

use crate::{
    endpoint::{EndpointPool, LogSource},
    error::IndexerError,
};

/// AMM deployment being indexed.
#[derive(Clone, Debug)]
pub struct Deployment {
    contract: Address,
    deployed_at_block: u64,
    collateral_token: Option<Address>,
    markets: Vec<types::MarketId>,
    normalizer: num::Normalizer,
}

impl Deployment {
    pub fn new(
        contract: Address,
        deployed_at_block: u64,
        markets: Vec<types::MarketId>,
        normalizer: num::Normalizer,
    ) -> Self {
        Self { contract, deployed_at_block, collateral_token: None, markets, normalizer }
    }

    pub fn with_collateral_token(mut self, token: Address) -> Self {
        self.collateral_token = Some(token);
        self
    }

    pub fn contract(&self) -> Address { self.contract }

    pub fn deployed_at_block(&self) -> u64 { self.deployed_at_block }

    /// Markets to index; empty means every market of the contract.
    pub fn markets(&self) -> &[types::MarketId] { &self.markets }

    pub fn normalizer(&self) -> &num::Normalizer { &self.normalizer }

    /// Checks the configured cost scale against the collateral token's
    /// on-chain `decimals()`, asking the endpoints in failover order.
    pub async fn verify_scale<S: LogSource>(
        &self,
        endpoints: &EndpointPool<S>,
    ) -> Result<u8, IndexerError> {
        let token = self.collateral_token.ok_or_else(|| {
            IndexerError::ScaleAmbiguity(
                "collateral token is not configured, cannot verify cost decimals".to_string(),
            )
        })?;
        let on_chain = endpoints.token_decimals(token).await?;
        let configured = self.normalizer.cost().decimals();
        if on_chain != configured {
            return Err(IndexerError::ScaleAmbiguity(format!(
                "collateral token {token} has {on_chain} decimals, cost scale is configured as \
                 {configured}"
            )));
        }
        info!(%token, decimals = on_chain, "cost scale verified");
        Ok(on_chain)
    }
}

