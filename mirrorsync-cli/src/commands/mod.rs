pub mod conflicts;
pub mod daemon;
pub mod init;
pub mod mirror;
pub mod pair;
pub mod status;
pub mod sync;
pub mod target;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use mirrorsync_core::config;
use mirrorsync_engine::{FileStateStore, HttpRemoteClient, RegistryConfigSource, Scheduler};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// The on-disk checkpoint and job state, sized by the configured history.
pub(crate) fn local_store(home: &Path) -> Result<FileStateStore> {
    let config = config::load_at(home).context("failed to load ~/.mirrorsync/config.yaml")?;
    Ok(FileStateStore::at(home, config.job_history))
}

/// A scheduler over the on-disk registry and state, for one-shot commands.
pub(crate) fn local_scheduler(home: &Path) -> Result<Scheduler> {
    let config = config::load_at(home).context("failed to load ~/.mirrorsync/config.yaml")?;
    let store = FileStateStore::at(home, config.job_history);
    Ok(Scheduler::new(
        config,
        Arc::new(RegistryConfigSource::at(home)),
        Arc::new(store),
        Arc::new(HttpRemoteClient::new(Duration::from_secs(30))),
    ))
}
