use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, Bytes, LogData, U256, address},
    rpc::types::{Filter, Log},
};
use amm_indexer::{
    Deployment,
    abi::SharesPurchased,
    endpoint::EndpointPool,
    error::IndexerError,
    ledger::{
        Ledger, TradeQuery,
        repair::{RepairOptions, repair},
    },
    num::Normalizer,
    pipeline::{Indexer, IndexerConfig},
    retry::RetryPolicy,
    testing::{Fault, LogBuilder, MockSource, tx_hash},
    types::ScanOrder,
    worker::{GiveUp, WorkerSettings},
};
use alloy_sol_types::SolEvent;
use tokio_util::sync::CancellationToken;

const AMM: Address = address!("0x00000000000000000000000000000000000a3300");
const BUYER: Address = address!("0x00000000000000000000000000000000000000b1");
const USDC: Address = address!("0x00000000000000000000000000000000000c0c0c");
const DEPLOYED_AT: u64 = 100_000;

fn one_share() -> U256 { U256::from(10).pow(U256::from(18)) }

fn config(chunk_size: u64, concurrency: usize) -> IndexerConfig {
    IndexerConfig {
        chunk_size,
        worker: WorkerSettings {
            concurrency,
            retry: RetryPolicy::new(1, Duration::from_millis(1), 2),
            request_delay: Duration::ZERO,
            give_up: GiveUp::Skip,
        },
        progress_every: 1,
        confirmations: 0,
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn indexer_with(
    sources: Vec<Arc<MockSource>>,
    markets: Vec<u64>,
    normalizer: Normalizer,
    config: IndexerConfig,
) -> Indexer<Arc<MockSource>> {
    let pool = EndpointPool::new(sources, Duration::from_millis(200)).unwrap();
    let deployment = Deployment::new(AMM, DEPLOYED_AT, markets, normalizer);
    Indexer::new(deployment, pool, Ledger::in_memory().await.unwrap(), config).unwrap()
}

async fn indexer(
    source: Arc<MockSource>,
    markets: Vec<u64>,
    chunk_size: u64,
) -> Indexer<Arc<MockSource>> {
    let normalizer = Normalizer::new(18, 6).unwrap();
    indexer_with(vec![source], markets, normalizer, config(chunk_size, 4)).await
}

fn scenario_a_log() -> Log {
    LogBuilder::new(AMM)
        .at(100_500, 0)
        .tx(tx_hash(0xa))
        .shares_purchased(4, BUYER, 0, one_share(), U256::from(650_000))
}

#[tokio::test]
async fn single_trade_is_normalized() {
    let source = Arc::new(MockSource::new("a").with_head(100_999).with_logs([scenario_a_log()]));
    let indexer = indexer(source, vec![4], 1000).await;

    let summary =
        indexer.backfill(100_000, Some(100_999), &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.chunks_total, 1);
    assert_eq!(summary.logs_found, 1);
    assert_eq!(summary.inserted, 1);
    assert!(summary.is_complete());

    let trades = indexer.ledger().trades(&TradeQuery::default()).await.unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.market_id, 4);
    assert_eq!(trade.outcome_index, 0);
    assert_eq!(trade.shares, "1.0");
    assert_eq!(trade.total_cost, "0.65");
    assert_eq!(trade.price_per_share, "0.65");
    assert_eq!(trade.user_address, format!("{BUYER:#x}"));
    assert_eq!(trade.tx_hash, format!("{:#x}", tx_hash(0xa)));
    assert_eq!(indexer.ledger().aggregate(4).await.unwrap().unwrap().volume, "0.65");
}

#[tokio::test]
async fn redelivered_log_is_written_once() {
    let source = Arc::new(
        MockSource::new("a").with_head(100_999).with_logs([scenario_a_log(), scenario_a_log()]),
    );
    let indexer = indexer(source, vec![4], 1000).await;

    let summary =
        indexer.backfill(100_000, Some(100_999), &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.logs_found, 2);
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(indexer.ledger().trade_count().await.unwrap(), 1);
    assert_eq!(indexer.ledger().aggregate(4).await.unwrap().unwrap().volume, "0.65");
}

#[tokio::test]
async fn rerunning_backfill_is_idempotent() {
    let logs = (0..40u64).map(|i| {
        LogBuilder::new(AMM).at(100_000 + i * 97, 0).tx(tx_hash(i + 1)).shares_purchased(
            i % 3,
            BUYER,
            i % 2,
            one_share(),
            U256::from(10_000 * (i + 1)),
        )
    });
    let source = Arc::new(MockSource::new("a").with_head(104_000).with_logs(logs));
    let indexer = indexer(source, vec![], 250).await;
    let cancel = CancellationToken::new();

    let first = indexer.backfill(100_000, Some(104_000), &cancel).await.unwrap();
    let rows_once = indexer.ledger().trades(&TradeQuery::default()).await.unwrap();
    let volumes_once = indexer.ledger().aggregates().await.unwrap();

    let second = indexer.backfill(100_000, Some(104_000), &cancel).await.unwrap();
    let rows_twice = indexer.ledger().trades(&TradeQuery::default()).await.unwrap();

    assert_eq!(first.inserted, 40);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 40);
    assert_eq!(
        rows_once.iter().map(|r| &r.tx_hash).collect::<Vec<_>>(),
        rows_twice.iter().map(|r| &r.tx_hash).collect::<Vec<_>>()
    );
    assert_eq!(volumes_once, indexer.ledger().aggregates().await.unwrap());

    // Incremental volumes equal the sums of the rows
    assert!(indexer.ledger().reconcile_volumes().await.unwrap().is_empty());
}

#[tokio::test]
async fn most_recent_first_covers_same_trades() {
    let logs = (0..10u64).map(|i| {
        LogBuilder::new(AMM).at(100_000 + i * 333, 0).tx(tx_hash(i + 1)).shares_purchased(
            1,
            BUYER,
            0,
            one_share(),
            U256::from(1_000_000),
        )
    });
    let source = Arc::new(MockSource::new("a").with_head(103_500).with_logs(logs));
    let mut cfg = config(500, 3);
    cfg.order = ScanOrder::MostRecentFirst;
    let indexer = indexer_with(vec![source], vec![1], Normalizer::new(18, 6).unwrap(), cfg).await;

    let summary = indexer.backfill(100_000, None, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.inserted, 10);
    assert_eq!(summary.indexed_to, Some(103_500));
    assert_eq!(indexer.ledger().aggregate(1).await.unwrap().unwrap().volume, "10.0");
}

#[tokio::test]
async fn legacy_and_malformed_logs() {
    let legacy = LogBuilder::new(AMM).at(100_010, 0).tx(tx_hash(1)).trade_executed(
        4,
        BUYER,
        1,
        U256::from(2_000_000),
        U256::from(4) * one_share(),
    );
    let valid = SharesPurchased {
        marketId: U256::from(4),
        buyer: BUYER,
        outcomeIndex: U256::ZERO,
        shares: one_share(),
        totalCost: U256::from(1),
    }
    .encode_log_data();
    let truncated = LogBuilder::new(AMM).at(100_020, 0).tx(tx_hash(2)).raw(LogData::new_unchecked(
        valid.topics().to_vec(),
        Bytes::copy_from_slice(&valid.data[..32]),
    ));
    let current = LogBuilder::new(AMM).at(100_030, 0).tx(tx_hash(3)).shares_purchased(
        4,
        BUYER,
        0,
        one_share(),
        U256::from(500_000),
    );
    let source =
        Arc::new(MockSource::new("a").with_head(100_999).with_logs([legacy, truncated, current]));
    let indexer = indexer(source, vec![4], 1000).await;

    let summary =
        indexer.backfill(100_000, Some(100_999), &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.logs_found, 3);
    assert_eq!(summary.malformed_logs, 1);
    assert_eq!(summary.inserted, 2);
    assert!(summary.is_complete());

    let trades = indexer.ledger().trades(&TradeQuery::default()).await.unwrap();
    assert_eq!(trades[0].outcome_index, 1);
    assert_eq!(trades[0].shares, "4.0");
    assert_eq!(trades[0].total_cost, "2.0");
    assert_eq!(trades[0].price_per_share, "0.5");
    assert_eq!(indexer.ledger().aggregate(4).await.unwrap().unwrap().volume, "2.5");
}

#[tokio::test]
async fn failover_hides_timed_out_endpoint() {
    let first = Arc::new(MockSource::new("first").with_head(100_999));
    first.fail_next(1, Fault::Timeout);
    let second = Arc::new(MockSource::new("second").with_head(100_999).with_logs([scenario_a_log()]));

    let indexer = indexer_with(
        vec![first.clone(), second.clone()],
        vec![4],
        Normalizer::new(18, 6).unwrap(),
        config(1000, 1),
    )
    .await;
    let summary =
        indexer.backfill(100_000, Some(100_999), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.chunks_failed, 0);
    assert_eq!(summary.inserted, 1);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
}

#[tokio::test]
async fn hanging_endpoint_is_bounded_by_timeout() {
    let first = Arc::new(MockSource::new("first"));
    first.fail_next(1, Fault::Hang(Duration::from_secs(30)));
    let second = Arc::new(MockSource::new("second").with_logs([scenario_a_log()]));
    let pool = EndpointPool::new(vec![first, second], Duration::from_millis(50)).unwrap();

    let started = std::time::Instant::now();
    let filter = Filter::new().from_block(100_000).to_block(100_999);
    assert_eq!(pool.logs(&filter).await.unwrap(), vec![scenario_a_log()]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn failing_chunk_is_skipped_and_holds_cursor() {
    let source = Arc::new(MockSource::new("a").with_head(100_999).with_logs([
        LogBuilder::new(AMM).at(100_050, 0).tx(tx_hash(1)).shares_purchased(
            4,
            BUYER,
            0,
            one_share(),
            U256::from(1_000_000),
        ),
        LogBuilder::new(AMM).at(100_500, 0).tx(tx_hash(2)).shares_purchased(
            4,
            BUYER,
            0,
            one_share(),
            U256::from(1_000_000),
        ),
    ]));
    // First attempt and its single retry both fail for the first chunk
    source.fail_next(2, Fault::Transport);
    let indexer = indexer_with(
        vec![source],
        vec![4],
        Normalizer::new(18, 6).unwrap(),
        config(100, 1),
    )
    .await;

    let summary =
        indexer.backfill(100_000, Some(100_999), &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.chunks_total, 10);
    assert_eq!(summary.chunks_failed, 1);
    assert_eq!(summary.chunks_committed, 9);
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.indexed_to, None);
    assert!(!summary.is_complete());
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), None);
}

#[tokio::test]
async fn backfill_sets_cursor_only_when_contiguous() {
    let source = Arc::new(MockSource::new("a").with_head(300_000));
    let indexer = indexer(source, vec![4], 1000).await;
    let cancel = CancellationToken::new();

    indexer.backfill(DEPLOYED_AT, Some(100_999), &cancel).await.unwrap();
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), Some(100_999));

    // Gap between 101_000 and 199_999: cursor stays
    indexer.backfill(200_000, Some(200_999), &cancel).await.unwrap();
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), Some(100_999));

    // Overlapping rescan extends it
    indexer.backfill(100_500, Some(101_999), &cancel).await.unwrap();
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), Some(101_999));
}

#[tokio::test]
async fn continuous_resumes_from_cursor() {
    let source = Arc::new(MockSource::new("a").with_head(100_999).with_logs([scenario_a_log()]));
    let indexer = indexer(source.clone(), vec![4], 1000).await;
    let cancel = CancellationToken::new();

    let first = indexer.run_once(&cancel).await.unwrap();
    assert_eq!(first.inserted, 1);
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), Some(100_999));

    // Nothing new: no chunk is scanned
    let idle = indexer.run_once(&cancel).await.unwrap();
    assert_eq!(idle.chunks_total, 0);

    source.push_log(LogBuilder::new(AMM).at(101_200, 1).tx(tx_hash(0xb)).shares_purchased(
        4,
        BUYER,
        1,
        one_share(),
        U256::from(350_000),
    ));
    source.set_head(101_500);
    let second = indexer.run_once(&cancel).await.unwrap();
    assert_eq!(second.chunks_total, 1);
    assert_eq!(second.inserted, 1);
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), Some(101_500));
    assert_eq!(indexer.ledger().aggregate(4).await.unwrap().unwrap().volume, "1.0");
}

#[tokio::test]
async fn continuous_requeues_until_success() {
    let source = Arc::new(MockSource::new("a").with_head(100_999).with_logs([scenario_a_log()]));
    source.fail_next(2, Fault::Protocol { code: 429 });
    let indexer = indexer_with(
        vec![source],
        vec![4],
        Normalizer::new(18, 6).unwrap(),
        config(1000, 2),
    )
    .await;

    let summary = indexer.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.chunks_requeued, 1);
    assert_eq!(summary.chunks_committed, 1);
    assert!(summary.is_complete());
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), Some(100_999));
}

#[tokio::test]
async fn confirmations_hold_back_recent_blocks() {
    let source = Arc::new(MockSource::new("a").with_head(100_999).with_logs([scenario_a_log()]));
    let mut cfg = config(1000, 1);
    cfg.confirmations = 600;
    let indexer = indexer_with(vec![source], vec![4], Normalizer::new(18, 6).unwrap(), cfg).await;

    let summary = indexer.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.inserted, 0);
    assert_eq!(indexer.ledger().cursor().get(4).await.unwrap(), Some(100_399));
}

#[tokio::test]
async fn cancelled_run_stops() {
    let source = Arc::new(MockSource::new("a").with_head(10_000_000));
    let indexer = indexer(source, vec![4], 10).await;
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });
    let summary = indexer.run_continuous(&cancel).await.unwrap();
    assert!(summary.interrupted);
    assert!(summary.chunks_committed < summary.chunks_total);
}

#[tokio::test]
async fn repair_fixes_rows_written_with_wrong_scale() {
    // Cost normalized with the share scale: the historical defect
    let source = Arc::new(MockSource::new("a").with_head(100_999).with_logs([scenario_a_log()]));
    let indexer = indexer_with(
        vec![source],
        vec![4],
        Normalizer::new(18, 18).unwrap(),
        config(1000, 1),
    )
    .await;
    indexer.backfill(100_000, Some(100_999), &CancellationToken::new()).await.unwrap();
    let ledger = indexer.ledger();
    assert_eq!(ledger.aggregate(4).await.unwrap().unwrap().volume, "0.00000000000065");

    let report = repair(
        ledger.pool(),
        &RepairOptions { checkpoint: Some(100_000), confirm: true, ..Default::default() },
    )
    .await
    .unwrap();
    assert_eq!(report.trades_rescaled(), 1);
    assert_eq!(report.cursors_rewound, 1);

    let trade = &ledger.trades(&TradeQuery::default()).await.unwrap()[0];
    assert_eq!(trade.total_cost, "0.65");
    assert_eq!(trade.price_per_share, "0.65");
    assert_eq!(ledger.aggregate(4).await.unwrap().unwrap().volume, "0.65");
    assert_eq!(ledger.cursor().get(4).await.unwrap(), Some(100_000));
    assert!(ledger.reconcile_volumes().await.unwrap().is_empty());
}

fn usdc_deployment(cost_decimals: u8) -> Deployment {
    Deployment::new(AMM, DEPLOYED_AT, vec![4], Normalizer::new(18, cost_decimals).unwrap())
        .with_collateral_token(USDC)
}

#[tokio::test]
async fn scale_verification_fails_over_to_next_endpoint() {
    let down = Arc::new(MockSource::new("down").with_token(USDC, 6));
    down.set_down(true);
    let up = Arc::new(MockSource::new("up").with_token(USDC, 6));
    let pool = EndpointPool::new(vec![down.clone(), up], Duration::from_millis(200)).unwrap();

    assert_eq!(usdc_deployment(6).verify_scale(&pool).await.unwrap(), 6);
    assert_eq!(down.calls(), 1);
}

#[tokio::test]
async fn scale_verification_rejects_mismatch() {
    let source = Arc::new(MockSource::new("a").with_token(USDC, 6));
    let pool = EndpointPool::new(vec![source], Duration::from_millis(200)).unwrap();

    assert!(matches!(
        usdc_deployment(18).verify_scale(&pool).await,
        Err(IndexerError::ScaleAmbiguity(_))
    ));
}

#[tokio::test]
async fn scale_verification_needs_collateral_token() {
    let source = Arc::new(MockSource::new("a").with_token(USDC, 6));
    let pool = EndpointPool::new(vec![source.clone()], Duration::from_millis(200)).unwrap();
    let deployment = Deployment::new(AMM, DEPLOYED_AT, vec![4], Normalizer::new(18, 6).unwrap());

    assert!(matches!(
        deployment.verify_scale(&pool).await,
        Err(IndexerError::ScaleAmbiguity(_))
    ));
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn backfill_fails_when_every_endpoint_is_down() {
    let source = Arc::new(MockSource::new("a").with_head(100_999));
    source.set_down(true);
    let indexer = indexer(source, vec![4], 1000).await;

    assert!(matches!(
        indexer.backfill(100_000, None, &CancellationToken::new()).await,
        Err(IndexerError::AllEndpointsExhausted { attempted: 1, .. })
    ));
}
