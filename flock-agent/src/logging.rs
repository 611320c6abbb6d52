//! Tracing subscriber setup. `RUST_LOG` wins over the configured level.

use anyhow::Result;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub fn init_logging(config: &Config) -> Result<()> {
    let filter = filter(config);
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
        "pretty" => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()?,
        _ => registry.with(tracing_subscriber::fmt::layer().compact()).try_init()?,
    }
    Ok(())
}

fn filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}
