//! Orchestration of backfills and the continuous indexer.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    Deployment,
    decode::Decoder,
    endpoint::{EndpointPool, LogSource},
    error::IndexerError,
    ledger::{Ledger, cursor::Watermark, writer::LedgerWriter},
    partition::{ChunkQueue, partition},
    types::ScanOrder,
    worker::{ChunkOutcome, GiveUp, LogQuery, WorkerPool, WorkerSettings},
};

#[derive(Clone, Copy, Debug)]
pub struct IndexerConfig {
    /// Blocks per chunk.
    pub chunk_size: u64,
    pub worker: WorkerSettings,
    pub order: ScanOrder,
    /// Log progress every this many processed chunks.
    pub progress_every: usize,
    /// Blocks behind the head the continuous indexer stays, so that only
    /// settled blocks are indexed.
    pub confirmations: u64,
    /// Pause of the continuous indexer once it caught up.
    pub poll_interval: Duration,
    /// Batches queued towards the ledger writer.
    pub writer_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            worker: WorkerSettings::default(),
            order: ScanOrder::Ascending,
            progress_every: 10,
            confirmations: 2,
            poll_interval: Duration::from_secs(5),
            writer_capacity: 64,
        }
    }
}

/// Counters of one or more scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub chunks_total: usize,
    pub chunks_committed: usize,
    pub chunks_failed: usize,
    pub chunks_requeued: usize,
    pub logs_found: usize,
    pub malformed_logs: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Last block of the contiguous committed range.
    pub indexed_to: Option<u64>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &ChunkOutcome) {
        match outcome {
            ChunkOutcome::Committed { logs, malformed, commit, .. } => {
                self.chunks_committed += 1;
                self.logs_found += logs;
                self.malformed_logs += malformed;
                self.inserted += commit.inserted;
                self.duplicates += commit.duplicates;
            },
            ChunkOutcome::Failed { requeued: true, .. } => self.chunks_requeued += 1,
            ChunkOutcome::Failed { requeued: false, .. } => self.chunks_failed += 1,
        }
    }

    /// Chunks that reached a final state.
    pub fn chunks_processed(&self) -> usize { self.chunks_committed + self.chunks_failed }

    /// Whether every chunk was committed.
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.chunks_committed == self.chunks_total
    }

    /// Adds the counters of a later scan.
    pub fn merge(&mut self, other: &RunSummary) {
        self.chunks_total += other.chunks_total;
        self.chunks_committed += other.chunks_committed;
        self.chunks_failed += other.chunks_failed;
        self.chunks_requeued += other.chunks_requeued;
        self.logs_found += other.logs_found;
        self.malformed_logs += other.malformed_logs;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.indexed_to = other.indexed_to.max(self.indexed_to);
        self.interrupted |= other.interrupted;
    }
}

#[cfg(feature = "display")]
impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use colored::Colorize;
        use tabled::{Table, settings::Style};

        let failed = if self.chunks_failed > 0 {
            self.chunks_failed.to_string().red().to_string()
        } else {
            self.chunks_failed.to_string()
        };
        let malformed = if self.malformed_logs > 0 {
            self.malformed_logs.to_string().yellow().to_string()
        } else {
            self.malformed_logs.to_string()
        };
        let rows = vec![
            ["Chunks attempted".to_string(), self.chunks_total.to_string()],
            ["Chunks committed".to_string(), self.chunks_committed.to_string().green().to_string()],
            ["Chunks failed".to_string(), failed],
            ["Chunk retries requeued".to_string(), self.chunks_requeued.to_string()],
            ["Logs found".to_string(), self.logs_found.to_string()],
            ["Malformed logs skipped".to_string(), malformed],
            ["Rows inserted".to_string(), self.inserted.to_string().green().to_string()],
            ["Duplicates skipped".to_string(), self.duplicates.to_string()],
            [
                "Indexed to block".to_string(),
                self.indexed_to.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string()),
            ],
        ];
        let mut table = Table::from_iter(rows);
        table.with(Style::sharp());
        writeln!(f, "{table}")?;
        if self.interrupted {
            write!(f, "{}", "Interrupted before completion".yellow())?;
        }
        Ok(())
    }
}

/// Drives scans of one deployment into one ledger.
pub struct Indexer<S> {
    deployment: Deployment,
    endpoints: Arc<EndpointPool<S>>,
    ledger: Ledger,
    decoder: Decoder,
    config: IndexerConfig,
}

impl<S: LogSource + 'static> Indexer<S> {
    pub fn new(
        deployment: Deployment,
        endpoints: EndpointPool<S>,
        ledger: Ledger,
        config: IndexerConfig,
    ) -> Result<Self, IndexerError> {
        if config.chunk_size == 0 {
            return Err(IndexerError::InvalidArgument("chunk size must be positive".to_string()));
        }
        if config.worker.concurrency == 0 {
            return Err(IndexerError::InvalidArgument("concurrency must be positive".to_string()));
        }
        Ok(Self {
            deployment,
            endpoints: Arc::new(endpoints),
            ledger,
            decoder: Decoder::default(),
            config,
        })
    }

    pub fn deployment(&self) -> &Deployment { &self.deployment }

    pub fn ledger(&self) -> &Ledger { &self.ledger }

    /// Scans `[start, end]` regardless of stored cursors, `end` defaulting to
    /// the current head. Chunks that keep failing are skipped.
    ///
    /// Afterwards each market's cursor is moved to the end of the committed
    /// range if that range connects to where the cursor left off.
    pub async fn backfill(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, IndexerError> {
        let end = match end {
            Some(end) => end,
            None => self.endpoints.block_number().await?,
        };
        info!(
            start,
            end,
            chunk_size = self.config.chunk_size,
            order = %self.config.order,
            "backfill started"
        );
        let summary = self.scan(start, end, GiveUp::Skip, false, cancel).await?;

        if let Some(indexed_to) = summary.indexed_to {
            let cursor = self.ledger.cursor();
            for market in self.deployment.markets() {
                let resume = self.resume_block(*market).await?;
                if indexed_to < resume {
                    continue;
                }
                if start <= resume {
                    cursor.advance(*market, indexed_to).await?;
                } else {
                    warn!(market, resume, start, "backfill does not connect to cursor, left as is");
                }
            }
        }

        info!(?summary, "backfill finished");
        Ok(summary)
    }

    /// One round of the continuous indexer: from the earliest market cursor
    /// up to the settled head. Failing chunks are retried until they succeed
    /// or the run is cancelled.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunSummary, IndexerError> {
        if self.deployment.markets().is_empty() {
            return Err(IndexerError::InvalidArgument(
                "continuous indexing needs at least one market to keep cursors for".to_string(),
            ));
        }
        let head = self.endpoints.block_number().await?;
        let Some(settled) = head.checked_sub(self.config.confirmations) else {
            return Ok(RunSummary::default());
        };

        let mut start = u64::MAX;
        for market in self.deployment.markets() {
            start = start.min(self.resume_block(*market).await?);
        }
        if start > settled {
            return Ok(RunSummary::default());
        }
        self.scan(start, settled, GiveUp::Requeue, true, cancel).await
    }

    /// Follows the chain until cancelled.
    pub async fn run_continuous(&self, cancel: &CancellationToken) -> Result<RunSummary, IndexerError> {
        info!(markets = ?self.deployment.markets(), "continuous indexer started");
        let mut total = RunSummary::default();
        while !cancel.is_cancelled() {
            let round = self.run_once(cancel).await;
            match round {
                Ok(round) => total.merge(&round),
                // Head lookup failed on every endpoint; try again next round
                Err(err) if err.is_upstream() => warn!(error = %err, "indexing round failed"),
                Err(err) => return Err(err),
            }
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = tokio::time::sleep(self.config.poll_interval) => {},
            }
        }
        total.interrupted = true;
        info!(?total, "continuous indexer stopped");
        Ok(total)
    }

    /// First block not yet indexed for `market`.
    async fn resume_block(&self, market: u64) -> Result<u64, IndexerError> {
        Ok(match self.ledger.cursor().get(market).await? {
            Some(block) => block.saturating_add(1),
            None => self.deployment.deployed_at_block(),
        })
    }

    async fn scan(
        &self,
        start: u64,
        end: u64,
        give_up: GiveUp,
        follow_cursor: bool,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, IndexerError> {
        let chunks = partition(start, end, self.config.chunk_size, self.config.order)?;
        let mut summary = RunSummary { chunks_total: chunks.len(), ..Default::default() };
        if chunks.is_empty() {
            return Ok(summary);
        }

        let queue = Arc::new(ChunkQueue::new(chunks));
        let (writer, writer_task) =
            LedgerWriter::spawn(self.ledger.pool().clone(), self.config.writer_capacity);
        let workers = Arc::new(WorkerPool::new(
            self.endpoints.clone(),
            LogQuery::new(
                self.deployment.contract(),
                self.decoder.signature_hashes(),
                self.deployment.markets().to_vec(),
            ),
            self.decoder.clone(),
            *self.deployment.normalizer(),
            writer,
            WorkerSettings { give_up, ..self.config.worker },
        ));
        let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
        let mut tasks = workers.clone().spawn(queue, cancel.clone(), outcomes_tx);

        let cursor = self.ledger.cursor();
        let mut watermark = Watermark::new(start);
        while let Some(outcome) = outcomes.recv().await {
            let before = summary.chunks_processed();
            summary.record(&outcome);
            if let ChunkOutcome::Committed { chunk, .. } = outcome
                && let Some(indexed_to) = watermark.commit(chunk)
                && follow_cursor
            {
                for market in self.deployment.markets() {
                    cursor.advance(*market, indexed_to).await?;
                }
            }
            let processed = summary.chunks_processed();
            if should_report(before, processed, self.config.progress_every) {
                info!(
                    processed,
                    total = summary.chunks_total,
                    logs = summary.logs_found,
                    inserted = summary.inserted,
                    duplicates = summary.duplicates,
                    failed = summary.chunks_failed,
                    "progress"
                );
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "chunk worker panicked");
            }
        }
        // Last writer handle goes with the workers
        drop(workers);
        if let Err(err) = writer_task.await {
            error!(error = %err, "ledger writer panicked");
        }

        summary.indexed_to = watermark.get();
        summary.interrupted = cancel.is_cancelled();
        Ok(summary)
    }
}

/// Whether moving from `before` to `after` processed chunks completes another
/// `every` of them. Requeued attempts do not count.
fn should_report(before: usize, after: usize, every: usize) -> bool {
    every > 0 && after > before && after % every == 0
}
