use clap::Parser;

#[tokio::main]
async fn main() {
    if let Err(err) = amm_indexer_cli::run(amm_indexer_cli::args::Cli::parse()).await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
