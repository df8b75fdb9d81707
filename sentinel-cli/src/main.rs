//! Entry point for the `sentinel` binary: drives one Sentinel Cycle Engine
//! turn against scripted local collaborators, for manual smoke-testing.
use clap::Parser;
use sentinel_cli::Cli;
use sentinel_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let code = run_main(cli).await?;
    std::process::exit(code);
}
