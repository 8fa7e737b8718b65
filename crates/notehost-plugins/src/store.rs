//! Plugin table persistence
//!
//! The registry writes a full JSON snapshot after every lifecycle transition.
//! Writes go to a sibling temp file that is then renamed over the target, so
//! a crash mid-write leaves the previous snapshot intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::model::PluginInfo;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage inconsistency: {0}")]
    Inconsistent(&'static str),
}

#[derive(Debug)]
pub struct PluginStore {
    path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl PluginStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            writer: Mutex::new(()),
        }
    }

    pub fn open(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            writer: Mutex::new(()),
        }
    }

    /// Load the last snapshot; an absent file is an empty table
    pub fn load(&self) -> Result<Vec<PluginInfo>, StorageError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Serialize writers. Callers collect the snapshot while holding the guard
    /// so an older snapshot can never overwrite a newer one.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn save(&self, _guard: &MutexGuard<'_, ()>, plugins: &[PluginInfo]) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(plugins)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), plugins = plugins.len(), "Saved plugin table");
        Ok(())
    }
}
