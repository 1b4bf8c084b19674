/*!
Store file placement and relocation.

Store files live in one of two directory types under a base directory:
`<base>/LocalStore` or `<base>/CloudStore`.
*/

use crate::events::StoreEvent;
use crate::store::DataStore;
use crate::{DataStoreError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_STORE_FILE_NAME: &str = "store.json";

/// Directory type a store file is kept in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreDirectory {
    Local,
    Cloud,
}

impl StoreDirectory {
    pub fn directory_name(self) -> &'static str {
        match self {
            Self::Local => "LocalStore",
            Self::Cloud => "CloudStore",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Cloud,
            Self::Cloud => Self::Local,
        }
    }

    /// This directory type under `base`
    pub fn path_in(self, base: &Path) -> PathBuf {
        base.join(self.directory_name())
    }
}

/// Per-user data directory for store files
pub fn default_store_directory() -> Result<PathBuf> {
    ProjectDirs::from("", "", "datastore")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| DataStoreError::storage("No home directory to place the store in"))
}

/// Default store file path for `directory` under the per-user data directory
pub fn default_store_path(directory: StoreDirectory) -> Result<PathBuf> {
    Ok(directory
        .path_in(&default_store_directory()?)
        .join(DEFAULT_STORE_FILE_NAME))
}

/// Remove `root` and its subdirectories when they hold no files
///
/// # Returns
/// Whether `root` was removed
fn remove_empty_directories(root: &Path) -> Result<bool> {
    if !root.is_dir() {
        return Ok(false);
    }

    let mut empty = true;
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() || !remove_empty_directories(&path)? {
            empty = false;
        }
    }
    if empty {
        fs::remove_dir(root)?;
        debug!(path = %root.display(), "Removed empty store directory");
    }
    Ok(empty)
}

impl DataStore {
    /// Flush pending changes ahead of replacing the persistent store
    ///
    /// When any context has changes a blocking full save runs and
    /// `ChangesSavedBeforeStoreSwap` is published with its outcome. Every
    /// context is reset afterwards, whether or not a save was needed or
    /// succeeded.
    pub fn prepare_for_store_swap(&self) -> Result<()> {
        let mut outcome = Ok(());
        if self.has_changes() {
            outcome = self.save_and_wait(None);
            if let Err(error) = &outcome {
                warn!(%error, "Saving before store swap failed");
            }
            self.events.publish(StoreEvent::ChangesSavedBeforeStoreSwap {
                error: outcome.as_ref().err().map(ToString::to_string),
            });
        }
        self.topology.reset_all();
        outcome
    }

    /// Move the store file into `directory` under `base`
    ///
    /// Pending changes are saved first; if that save fails the store is left
    /// where it is. Empty directories of the other directory type are pruned.
    ///
    /// # Returns
    /// The new location of the store file
    pub fn relocate_store(&self, base: &Path, directory: StoreDirectory) -> Result<PathBuf> {
        let current = self.store_location().ok_or_else(|| {
            DataStoreError::unsupported("an in-memory store can not be relocated")
        })?;
        self.prepare_for_store_swap()?;

        let file_name = current
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_FILE_NAME));
        let destination = directory.path_in(base).join(file_name);

        let target = destination.clone();
        self.topology
            .writer()
            .perform_and_wait(move |writer| writer.with_store(|store| store.relocate(&target)))??;
        self.topology.set_location(Some(destination.clone()));

        remove_empty_directories(&directory.other().path_in(base))?;

        info!(
            from = %current.display(),
            to = %destination.display(),
            ?directory,
            "Store relocated"
        );
        self.events.publish(StoreEvent::StoreMoved {
            location: destination.clone(),
            directory,
        });
        Ok(destination)
    }
}
