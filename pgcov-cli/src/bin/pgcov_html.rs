use anyhow::Result;
use clap::Parser;
use pgcov_cli::app::{self, AppConfig, Args};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    app::init_tracing(args.verbose);
    let config = AppConfig::try_from(args)?;
    app::run(config).await
}
