use anyhow::Result;
use certrelay_cli::{init_tracing, run_relay, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_relay(cli).await
}
