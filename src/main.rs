use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = snowrot::cli::Cli::parse();
    cli.run()
}
