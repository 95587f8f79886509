//! Live configuration shared with the hangup handler.
//!
//! `keyfleet serve` keeps the file it started from; SIGHUP re-reads it and
//! the backend registry picks up the new descriptors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::loader::ConfigError;
use crate::config::types::Config;

/// Last successfully loaded configuration and the file it came from.
#[derive(Clone)]
pub struct ConfigStore {
    current: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            current: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> Config {
        self.current.read().clone()
    }

    /// Re-read the file. A file that fails to load or validate leaves the
    /// running configuration untouched.
    pub fn reload(&self) -> Result<Config, ConfigError> {
        let fresh = Config::load_from(&self.path)?;
        *self.current.write() = fresh.clone();
        tracing::info!(
            path = %self.path.display(),
            backends = fresh.backends.len(),
            "Configuration reloaded"
        );
        Ok(fresh)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
