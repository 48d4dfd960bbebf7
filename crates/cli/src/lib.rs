pub mod args;
mod render;

use std::time::Duration;

use amm_indexer::{
    Deployment,
    endpoint::{EndpointPool, RpcEndpoint},
    ledger::{Ledger, TradeQuery, repair},
    num,
    pipeline::{Indexer, IndexerConfig},
    worker::WorkerSettings,
};
use anyhow::Context;
use args::Cli;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::args::Commands;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.log_level.as_deref())?;

    let ledger = Ledger::connect(&cli.database_url)
        .await
        .with_context(|| format!("opening ledger at {}", cli.database_url))?;

    let cancellation_signal = CancellationToken::new();
    let cancellation_token = cancellation_signal.child_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancellation_signal.cancel();
        }
    });

    match &cli.command {
        Commands::Backfill { start, end, chunk_size, concurrency, order } => {
            let config = IndexerConfig {
                chunk_size: *chunk_size,
                worker: WorkerSettings { concurrency: *concurrency, ..Default::default() },
                order: (*order).into(),
                ..Default::default()
            };
            let indexer = build_indexer(&cli, ledger, config).await?;
            let start = start.unwrap_or(indexer.deployment().deployed_at_block());
            let summary = indexer.backfill(start, *end, &cancellation_token).await?;
            println!("{summary}");
            if summary.chunks_failed > 0 {
                return Err(anyhow::anyhow!(
                    "{} chunk(s) failed, rerun the backfill over the same range to fill the gaps",
                    summary.chunks_failed
                ));
            }
        },
        Commands::Index { chunk_size, concurrency, confirmations, poll_interval } => {
            if cli.market.is_empty() {
                return Err(anyhow::anyhow!(
                    "at least one market should be provided, see `--market`"
                ));
            }
            let config = IndexerConfig {
                chunk_size: *chunk_size,
                worker: WorkerSettings { concurrency: *concurrency, ..Default::default() },
                confirmations: *confirmations,
                poll_interval: Duration::from_secs(*poll_interval),
                ..Default::default()
            };
            let indexer = build_indexer(&cli, ledger, config).await?;
            let summary = indexer.run_continuous(&cancellation_token).await?;
            println!("{summary}");
        },
        Commands::Repair { confirm, checkpoint, threshold } => {
            let options = repair::RepairOptions {
                threshold: num::parse(threshold).context("parsing repair threshold")?,
                checkpoint: *checkpoint,
                confirm: *confirm,
                ..Default::default()
            };
            let report = repair::repair(ledger.pool(), &options).await?;
            render::repair(&report);
        },
        Commands::Reconcile => {
            let drifts = ledger.reconcile_volumes().await?;
            render::drifts(&drifts);
        },
        Commands::Trades { user, since, until, limit } => {
            let market = match cli.market.as_slice() {
                [] => None,
                [market] => Some(*market),
                _ => {
                    return Err(anyhow::anyhow!(
                        "at most one market should be provided, see `--market`"
                    ));
                },
            };
            let query = TradeQuery {
                market,
                user: *user,
                since: *since,
                until: *until,
                limit: (*limit > 0).then_some(*limit),
            };
            let trades = ledger.trades(&query).await?;
            render::trades(&trades);
        },
        Commands::Markets => {
            let aggregates = ledger.aggregates().await?;
            render::markets(&aggregates, ledger.trade_count().await?);
        },
    }

    Ok(())
}

fn init_tracing(directives: Option<&str>) -> anyhow::Result<()> {
    let filter = match directives {
        Some(directives) => EnvFilter::try_new(directives).context("parsing `--log-level`")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("installing log subscriber")
}

async fn build_indexer(
    cli: &Cli,
    ledger: Ledger,
    config: IndexerConfig,
) -> anyhow::Result<Indexer<RpcEndpoint>> {
    if cli.rpc.is_empty() {
        return Err(anyhow::anyhow!("no RPC endpoint configured, see `--rpc`"));
    }
    let contract = cli
        .contract
        .ok_or_else(|| anyhow::anyhow!("contract address should be provided, see `--contract`"))?;
    let normalizer = num::Normalizer::from_config(cli.share_decimals, cli.cost_decimals)?;

    let mut deployment = Deployment::new(contract, cli.deployed_at, cli.market.clone(), normalizer);
    if let Some(token) = cli.collateral_token {
        deployment = deployment.with_collateral_token(token);
    }

    let endpoints =
        EndpointPool::connect(&cli.rpc, Duration::from_millis(cli.rpc_timeout_ms))
            .context("connecting to RPC")?;
    if cli.verify_decimals {
        deployment.verify_scale(&endpoints).await.context("verifying cost decimals")?;
    }
    info!(
        %contract,
        endpoints = cli.rpc.len(),
        markets = ?cli.market,
        database = %cli.database_url,
        "indexer configured"
    );

    Ok(Indexer::new(deployment, endpoints, ledger, config)?)
}
