//! Rebuild the TS store from SOT facts

use crate::commands::{open_platform, CommandError, CommandResult, Outcome};
use tracing::info;

pub fn run(config_path: &str) -> CommandResult {
    let (_config, sot, ts) = open_platform(config_path)?;
    let applied = ts
        .rebuild_from_sot(&sot, None)
        .map_err(|e| CommandError::Other(e.into()))?;
    info!("TS store rebuilt from {applied} fills");
    Ok(Outcome::Done)
}
