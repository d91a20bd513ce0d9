use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{self, EnvFilter};

use cmc_pipeline::cli::{self, Cli};

fn main() -> Result<()> {
    // .env is optional; environment always wins
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = cli::run(&cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
