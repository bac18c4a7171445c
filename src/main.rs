use anyhow::Result;
use clap::Parser;
use warelay::{cli, config, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything else (silently ignore if missing).
    dotenvy::dotenv().ok();

    let cli_args = cli::Cli::parse();

    // Logging level comes from the config file unless --debug wins.
    let level = match &cli_args.config {
        Some(path) => config::Config::load_from(std::path::Path::new(path))
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
        None => config::Config::load()
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
    };
    logging::init_logging(&level, cli_args.debug)?;

    cli::run(cli_args).await
}
