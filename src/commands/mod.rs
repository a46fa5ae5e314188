//! CLI subcommands

pub mod intake;
pub mod rebuild;
pub mod run;
pub mod summary;

use anyhow::Error;

/// How a command finished.
#[derive(Debug)]
pub enum Outcome {
    Done,
    /// The run loop was interrupted (Ctrl-C); maps to exit code 130.
    Interrupted,
}

/// Failure classes with distinct exit codes.
#[derive(Debug)]
pub enum CommandError {
    Config(Error),
    StoreOpen(Error),
    Other(Error),
}

impl From<Error> for CommandError {
    fn from(err: Error) -> Self {
        CommandError::Other(err)
    }
}

pub type CommandResult = Result<Outcome, CommandError>;

/// Shared bootstrap: load config (exit 2 on failure) and open both
/// stores (exit 3 on failure).
pub(crate) fn open_platform(
    config_path: &str,
) -> Result<
    (
        paper_trading::CoreConfig,
        std::sync::Arc<paper_trading::SotStore>,
        std::sync::Arc<paper_trading::TsStore>,
    ),
    CommandError,
> {
    use std::sync::Arc;

    let config = paper_trading::CoreConfig::from_file(config_path)
        .map_err(CommandError::Config)?;
    let sot = paper_trading::SotStore::open(&config.store.sot_db_path)
        .map_err(|e| CommandError::StoreOpen(e.into()))?;
    let ts = paper_trading::TsStore::open(&config.store.ts_db_path)
        .map_err(|e| CommandError::StoreOpen(e.into()))?;
    Ok((config, Arc::new(sot), Arc::new(ts)))
}
