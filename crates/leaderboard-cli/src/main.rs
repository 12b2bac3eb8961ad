use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = leaderboard_cli::Cli::parse();
    leaderboard_cli::run_cli(cli)
}
