//! Logger setup for the engine binary: journald when running as a service,
//! stdout/stderr when attached to a terminal.

use std::io::IsTerminal;

use tracing::warn;
use tracing_subscriber::{
    self,
    filter::{EnvFilter, LevelFilter},
    prelude::*,
    Layer,
};

const SYSLOG_IDENTIFIER: &str = "rauc-engine";

fn default_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

fn try_init_journal() -> eyre::Result<()> {
    let journal = tracing_journald::layer()?
        .with_syslog_identifier(SYSLOG_IDENTIFIER.to_owned())
        .with_filter(default_filter());
    tracing_subscriber::registry().with(journal).try_init()?;
    Ok(())
}

fn try_init_terminal_logger() -> eyre::Result<()> {
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stdout)
        .with_filter(default_filter());
    let stderr_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(
            stderr_log
                .with_filter(LevelFilter::WARN)
                .and_then(stdout_log),
        )
        .try_init()?;
    Ok(())
}

/// Initialize the logger.
pub fn init() {
    let istty = std::io::stdin().is_terminal();
    let journal_err = if istty { None } else { try_init_journal().err() };

    if istty || journal_err.is_some() {
        if let Err(e) = try_init_terminal_logger() {
            eprintln!("failed to initialize logging: {e}");
        }
    }
    if let Some(e) = journal_err {
        warn!("journald logger unavailable, using terminal logger: {e}");
    }
}
