//! Chunk workers: fetch, decode, normalize and hand over to the ledger writer.

use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Filter,
};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    decode::Decoder,
    endpoint::{EndpointPool, LogSource},
    error::IndexerError,
    ledger::writer::{CommitOutcome, WriterHandle},
    num::Normalizer,
    partition::ChunkQueue,
    retry::RetryPolicy,
    types::{self, Chunk},
};

/// What a worker does with a chunk once its retries are used up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GiveUp {
    /// Log it and move on; the chunk stays unindexed.
    #[default]
    Skip,
    /// Put it back on the queue to be attempted again later.
    Requeue,
}

/// Server-side log filter shared by all chunks of a run.
#[derive(Clone, Debug)]
pub struct LogQuery {
    address: Address,
    signatures: Vec<B256>,
    markets: Vec<types::MarketId>,
}

impl LogQuery {
    /// Logs emitted by `address` with any of the `signatures`, restricted to
    /// `markets` through the indexed market id unless that list is empty.
    pub fn new(address: Address, signatures: Vec<B256>, markets: Vec<types::MarketId>) -> Self {
        Self { address, signatures, markets }
    }

    pub fn filter(&self, chunk: Chunk) -> Filter {
        let filter = Filter::new()
            .address(self.address)
            .event_signature(self.signatures.clone())
            .from_block(chunk.from())
            .to_block(chunk.to());
        if self.markets.is_empty() {
            return filter;
        }
        filter.topic1(self.markets.iter().map(|id| B256::from(U256::from(*id))).collect::<Vec<_>>())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Pause of each worker between two chunks.
    pub request_delay: Duration,
    pub give_up: GiveUp,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            request_delay: Duration::from_millis(100),
            give_up: GiveUp::Skip,
        }
    }
}

/// Result of processing one chunk, reported to the orchestrator.
#[derive(Debug)]
pub enum ChunkOutcome {
    Committed {
        chunk: Chunk,
        /// Logs returned by the endpoint.
        logs: usize,
        /// Logs that could not be decoded and were skipped.
        malformed: usize,
        commit: CommitOutcome,
    },
    Failed {
        chunk: Chunk,
        error: IndexerError,
        requeued: bool,
    },
}

/// Everything a worker needs, shared read-only by all workers.
pub struct WorkerPool<S> {
    endpoints: Arc<EndpointPool<S>>,
    query: LogQuery,
    decoder: Decoder,
    normalizer: Normalizer,
    writer: WriterHandle,
    settings: WorkerSettings,
}

impl<S: LogSource + 'static> WorkerPool<S> {
    pub fn new(
        endpoints: Arc<EndpointPool<S>>,
        query: LogQuery,
        decoder: Decoder,
        normalizer: Normalizer,
        writer: WriterHandle,
        settings: WorkerSettings,
    ) -> Self {
        Self { endpoints, query, decoder, normalizer, writer, settings }
    }

    /// Spawns `concurrency` workers draining `queue`, each reporting every
    /// processed chunk on `outcomes`.
    pub fn spawn(
        self: Arc<Self>,
        queue: Arc<ChunkQueue>,
        cancel: CancellationToken,
        outcomes: mpsc::UnboundedSender<ChunkOutcome>,
    ) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        for id in 0..self.settings.concurrency.max(1) {
            let pool = self.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            let outcomes = outcomes.clone();
            workers.spawn(async move { pool.work(id, &queue, &cancel, &outcomes).await });
        }
        workers
    }

    async fn work(
        &self,
        id: usize,
        queue: &ChunkQueue,
        cancel: &CancellationToken,
        outcomes: &mpsc::UnboundedSender<ChunkOutcome>,
    ) {
        debug!(worker = id, "worker started");
        while !cancel.is_cancelled() {
            let chunk = match queue.claim() {
                Some(chunk) => chunk,
                None if self.settings.give_up == GiveUp::Skip || queue.is_drained() => break,
                // Another worker may still requeue a chunk
                None => {
                    if !pause(cancel, self.settings.request_delay.max(Duration::from_millis(10))).await {
                        break;
                    }
                    continue;
                },
            };

            let outcome = self.process(chunk, cancel).await;
            match &outcome {
                ChunkOutcome::Failed { requeued: true, .. } => queue.requeue(chunk),
                _ => queue.complete(),
            }
            if outcomes.send(outcome).is_err() {
                break;
            }
            if !pause(cancel, self.settings.request_delay).await {
                break;
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// Fetches, decodes and commits a single chunk.
    pub async fn process(&self, chunk: Chunk, cancel: &CancellationToken) -> ChunkOutcome {
        let filter = &self.query.filter(chunk);
        let endpoints = &*self.endpoints;
        let fetched = self
            .settings
            .retry
            .run(cancel, move |attempt| {
                if attempt > 0 {
                    debug!(chunk_from = chunk.from(), chunk_to = chunk.to(), attempt, "refetching chunk");
                }
                endpoints.logs(filter)
            })
            .await;
        let logs = match fetched {
            Ok(logs) => logs,
            Err(error) => return self.give_up(chunk, error),
        };

        let mut malformed = 0;
        let mut trades = Vec::with_capacity(logs.len());
        for log in &logs {
            match self.decoder.decode(log) {
                Ok(event) => trades.push(types::NormalizedTrade::new(event, &self.normalizer)),
                Err(err) => {
                    malformed += 1;
                    warn!(chunk_from = chunk.from(), chunk_to = chunk.to(), error = %err, "skipping log");
                },
            }
        }

        match self.writer.commit(Some(chunk), trades).await {
            Ok(commit) => ChunkOutcome::Committed { chunk, logs: logs.len(), malformed, commit },
            Err(error) => self.give_up(chunk, error),
        }
    }

    fn give_up(&self, chunk: Chunk, error: IndexerError) -> ChunkOutcome {
        let requeued =
            self.settings.give_up == GiveUp::Requeue && !matches!(error, IndexerError::Shutdown);
        if !matches!(error, IndexerError::Shutdown) {
            warn!(
                chunk_from = chunk.from(),
                chunk_to = chunk.to(),
                requeued,
                error = %error,
                "giving up on chunk"
            );
        }
        ChunkOutcome::Failed { chunk, error, requeued }
    }
}

/// Sleeps unless cancelled first; returns whether the worker should go on.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
