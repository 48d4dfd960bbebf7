use alloy::primitives::Address;
use amm_indexer::{endpoint, types};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

pub(crate) const DEFAULT_DATABASE_URL: &str = "sqlite://indexer.db";

#[derive(Parser, Debug)]
#[command(name = "amm-indexer", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// RPC endpoints in failover order, first one preferred
    #[arg(long, global = true, env = "INDEXER_RPC_URLS", value_delimiter = ',')]
    pub rpc: Vec<String>,

    /// Per-call RPC timeout in milliseconds
    #[arg(long, global = true, default_value_t = endpoint::DEFAULT_TIMEOUT.as_millis() as u64)]
    pub rpc_timeout_ms: u64,

    /// Ledger database
    #[arg(long, global = true, env = "DATABASE_URL", default_value_t = DEFAULT_DATABASE_URL.to_string())]
    pub database_url: String,

    /// AMM contract address
    #[arg(long, global = true, env = "INDEXER_CONTRACT")]
    pub contract: Option<Address>,

    /// Block the AMM contract was deployed at
    #[arg(long, global = true, env = "INDEXER_DEPLOYED_AT", default_value_t = 0)]
    pub deployed_at: u64,

    /// Markets to index [default: every market of the contract for
    /// `backfill`, required for `index`]
    #[arg(long, global = true, value_delimiter = ',')]
    pub market: Vec<types::MarketId>,

    /// Fixed-point decimals of share amounts
    #[arg(long, global = true, env = "INDEXER_SHARE_DECIMALS")]
    pub share_decimals: Option<u8>,

    /// Fixed-point decimals of cost amounts, i.e. of the collateral token
    #[arg(long, global = true, env = "INDEXER_COST_DECIMALS")]
    pub cost_decimals: Option<u8>,

    /// Collateral token, used to verify `--cost-decimals` on chain
    #[arg(long, global = true, env = "INDEXER_COLLATERAL_TOKEN")]
    pub collateral_token: Option<Address>,

    /// Refuse to index unless the collateral token's `decimals()` matches
    /// `--cost-decimals`
    #[arg(long, global = true, default_value_t = false)]
    pub verify_decimals: bool,

    /// Log filter directives, e.g. `info` or `amm_indexer=debug` [default:
    /// `RUST_LOG` or `info`]
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a bounded block range into the ledger
    Backfill {
        /// First block to scan [default: deployment block]
        #[arg(long)]
        start: Option<u64>,

        /// Last block to scan [default: current head]
        #[arg(long)]
        end: Option<u64>,

        /// Blocks per chunk
        #[arg(long, default_value_t = 1000)]
        chunk_size: u64,

        /// Chunks fetched concurrently
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Order in which chunks are scanned
        #[arg(long, value_enum, default_value_t = Order::Ascending)]
        order: Order,
    },
    /// Follow the chain from the stored cursors until terminated (Ctrl+C)
    Index {
        /// Blocks per chunk
        #[arg(long, default_value_t = 1000)]
        chunk_size: u64,

        /// Chunks fetched concurrently
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Blocks to stay behind the head
        #[arg(long, default_value_t = 2)]
        confirmations: u64,

        /// Seconds to wait between rounds once caught up
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,
    },
    /// Correct amounts written with the wrong fixed-point scale
    Repair {
        /// Commit the corrections [default: dry run, everything rolled back]
        #[arg(long, default_value_t = false)]
        confirm: bool,

        /// Rewind market cursors past this block so it gets re-indexed
        /// [required with `--confirm`]
        #[arg(long, required_if_eq("confirm", "true"))]
        checkpoint: Option<u64>,

        /// Non-zero amounts below this are considered mis-scaled
        #[arg(long, default_value_t = amm_indexer::ledger::repair::DEFAULT_THRESHOLD.to_string())]
        threshold: String,
    },
    /// Recompute every market's volume from its trades and fix drift
    Reconcile,
    /// Show indexed trades
    Trades {
        /// Only trades of this user
        #[arg(long)]
        user: Option<Address>,

        /// Only trades indexed at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only trades indexed before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Number of trades to show (0 = all)
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Show per-market volume and indexing progress
    Markets,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Order {
    Ascending,
    MostRecentFirst,
}

impl From<Order> for types::ScanOrder {
    fn from(order: Order) -> Self {
        match order {
            Order::Ascending => types::ScanOrder::Ascending,
            Order::MostRecentFirst => types::ScanOrder::MostRecentFirst,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_is_well_formed() { Cli::command().debug_assert(); }

    #[test]
    fn parses_backfill() {
        let cli = Cli::try_parse_from([
            "amm-indexer",
            "--rpc",
            "http://a,http://b",
            "--market",
            "1,2",
            "backfill",
            "--start",
            "100",
            "--order",
            "most-recent-first",
        ])
        .unwrap();
        assert_eq!(cli.rpc, vec!["http://a", "http://b"]);
        assert_eq!(cli.market, vec![1, 2]);
        match cli.command {
            Commands::Backfill { start, end, chunk_size, order, .. } => {
                assert_eq!(start, Some(100));
                assert_eq!(end, None);
                assert_eq!(chunk_size, 1000);
                assert_eq!(order, Order::MostRecentFirst);
            },
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn confirmed_repair_needs_checkpoint() {
        assert!(Cli::try_parse_from(["amm-indexer", "repair", "--confirm"]).is_err());

        let cli =
            Cli::try_parse_from(["amm-indexer", "repair", "--confirm", "--checkpoint", "500"])
                .unwrap();
        assert!(matches!(cli.command, Commands::Repair { confirm: true, checkpoint: Some(500), .. }));

        // Dry runs may leave the cursors alone
        assert!(Cli::try_parse_from(["amm-indexer", "repair"]).is_ok());
    }
}
