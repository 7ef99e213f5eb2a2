//! Structured logging setup.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Builds the filter from `logging.level`; `--verbose` raises this crate to debug.
pub fn env_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    let mut directives = config.level.clone();
    if verbose {
        directives.push_str(",lingua_relay=debug");
    }
    EnvFilter::try_new(&directives).map_err(|e| anyhow!("invalid log filter {directives:?}: {e}"))
}

/// Installs the global subscriber. Logs go to stderr so terminal progress output
/// on stdout stays readable.
pub fn init_tracing(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = env_filter(config, verbose)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
