use clap::Parser;
use cncstream::cli::{self, Cli};
use cncstream::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.json)?;
    tracing::debug!("cncstream {} built {}", cncstream::VERSION, cncstream::BUILD_DATE);

    cli::run(cli).await
}
