//! Command handlers.

pub mod config_cmd;
pub mod entities;
pub mod health;
pub mod run;
pub mod status;

use direktive_config::Config;
use direktive_core::config::STORE_FILE;
use direktive_core::{BridgeStore, StorageError};

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub(crate) fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(direktive_config::load_config_from(&global.config_path())?)
}

/// Open the persisted bridge state, if the daemon has ever run.
pub(crate) fn open_store(cfg: &Config) -> Result<Option<BridgeStore>, CliError> {
    let path = cfg.state_dir().join(STORE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    match BridgeStore::open(&path) {
        Ok(store) => Ok(Some(store)),
        Err(e) if e.is_locked() => Err(CliError::StoreLocked {
            path: path.display().to_string(),
        }),
        Err(e) => Err(storage(e)),
    }
}

pub(crate) fn storage(err: StorageError) -> CliError {
    direktive_core::CoreError::from(err).into()
}
