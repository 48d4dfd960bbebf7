//! Scripted in-memory log source and log builders.
//!
//! [`MockSource`] serves a fixed set of logs like an RPC node would, and can
//! be told to fail or hang on upcoming calls to exercise failover and retry.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, B256, LogData, TxHash, U256},
    rpc::types::{Filter, Log},
};
use alloy_sol_types::SolEvent;

use crate::{
    abi::{SharesPurchased, TradeExecuted},
    endpoint::LogSource,
    error::IndexerError,
    types,
};

/// Failure injected into a [`MockSource`] call.
#[derive(Clone, Debug)]
pub enum Fault {
    Transport,
    Protocol { code: i64 },
    /// Reports a timeout without waiting.
    Timeout,
    /// Waits this long before answering normally.
    Hang(Duration),
}

#[derive(Debug)]
pub struct MockSource {
    name: String,
    head: AtomicU64,
    logs: Mutex<Vec<Log>>,
    tokens: Mutex<HashMap<Address, u8>>,
    faults: Mutex<VecDeque<Fault>>,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl MockSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            head: AtomicU64::new(0),
            logs: Mutex::new(Vec::new()),
            tokens: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_head(self, head: u64) -> Self {
        self.set_head(head);
        self
    }

    pub fn with_logs(self, logs: impl IntoIterator<Item = Log>) -> Self {
        logs.into_iter().for_each(|log| self.push_log(log));
        self
    }

    /// Deploys an ERC-20 token with the given `decimals()`.
    pub fn with_token(self, token: Address, decimals: u8) -> Self {
        lock(&self.tokens).insert(token, decimals);
        self
    }

    pub fn set_head(&self, head: u64) { self.head.store(head, Ordering::SeqCst); }

    pub fn push_log(&self, log: Log) { lock(&self.logs).push(log); }

    /// Fails the next `times` log queries with `fault`. Head lookups are
    /// not affected.
    pub fn fail_next(&self, times: usize, fault: Fault) {
        let mut faults = lock(&self.faults);
        (0..times).for_each(|_| faults.push_back(fault.clone()));
    }

    /// Fails every call with a transport error while set.
    pub fn set_down(&self, down: bool) { self.down.store(down, Ordering::SeqCst); }

    /// Calls received so far, failed ones included.
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }

    async fn enter(&self, scripted: bool) -> Result<(), IndexerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(self.transport_error());
        }
        let fault = if scripted { lock(&self.faults).pop_front() } else { None };
        match fault {
            None => Ok(()),
            Some(Fault::Transport) => Err(self.transport_error()),
            Some(Fault::Protocol { code }) => Err(IndexerError::Protocol {
                endpoint: self.name.clone(),
                code,
                message: "scripted protocol error".to_string(),
            }),
            Some(Fault::Timeout) => {
                Err(IndexerError::Timeout { endpoint: self.name.clone(), timeout_ms: 10_000 })
            },
            Some(Fault::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            },
        }
    }

    fn transport_error(&self) -> IndexerError {
        IndexerError::Transport { endpoint: self.name.clone(), message: "connection refused".to_string() }
    }
}

impl LogSource for MockSource {
    fn name(&self) -> &str { &self.name }

    async fn block_number(&self) -> Result<u64, IndexerError> {
        self.enter(false).await?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, IndexerError> {
        self.enter(true).await?;
        let from = filter.get_from_block().unwrap_or(0);
        let to = filter.get_to_block().unwrap_or(u64::MAX);
        let mut matching = lock(&self.logs)
            .iter()
            .filter(|log| log.block_number.is_some_and(|b| from <= b && b <= to))
            .filter(|log| filter.matches(&log.inner))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(matching)
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, IndexerError> {
        self.enter(false).await?;
        lock(&self.tokens).get(&token).copied().ok_or_else(|| IndexerError::Protocol {
            endpoint: self.name.clone(),
            code: 3,
            message: "execution reverted".to_string(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic transaction hash for tests.
pub fn tx_hash(seed: u64) -> TxHash { B256::from(U256::from(seed)) }

/// Builds RPC logs as an AMM deployment would emit them.
#[derive(Clone, Copy, Debug)]
pub struct LogBuilder {
    contract: Address,
    block_number: u64,
    log_index: u64,
    tx_hash: TxHash,
}

impl LogBuilder {
    pub fn new(contract: Address) -> Self {
        Self { contract, block_number: 0, log_index: 0, tx_hash: tx_hash(1) }
    }

    pub fn at(mut self, block_number: u64, log_index: u64) -> Self {
        self.block_number = block_number;
        self.log_index = log_index;
        self
    }

    pub fn tx(mut self, tx_hash: TxHash) -> Self {
        self.tx_hash = tx_hash;
        self
    }

    /// Current event layout.
    pub fn shares_purchased(
        &self,
        market: types::MarketId,
        buyer: Address,
        outcome: types::OutcomeIndex,
        raw_shares: U256,
        raw_cost: U256,
    ) -> Log {
        self.raw(
            SharesPurchased {
                marketId: U256::from(market),
                buyer,
                outcomeIndex: U256::from(outcome),
                shares: raw_shares,
                totalCost: raw_cost,
            }
            .encode_log_data(),
        )
    }

    /// Legacy event layout.
    pub fn trade_executed(
        &self,
        market: types::MarketId,
        buyer: Address,
        outcome: u8,
        raw_cost: U256,
        raw_shares: U256,
    ) -> Log {
        self.raw(
            TradeExecuted {
                marketId: U256::from(market),
                buyer,
                outcome,
                cost: raw_cost,
                shares: raw_shares,
            }
            .encode_log_data(),
        )
    }

    pub fn raw(&self, data: LogData) -> Log {
        Log {
            inner: alloy::primitives::Log { address: self.contract, data },
            block_number: Some(self.block_number),
            transaction_hash: Some(self.tx_hash),
            log_index: Some(self.log_index),
            ..Default::default()
        }
    }
}
