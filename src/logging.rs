//! Logging setup.
//!
//! One-time tracing initialisation. The filter comes from `RUST_LOG` when
//! set, otherwise from the configured level (`--debug` forces `debug`).

use anyhow::Result;
use tracing_subscriber::EnvFilter;

pub fn init_logging(level: &str, debug: bool) -> Result<()> {
    let effective = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warelay={effective},info")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}
