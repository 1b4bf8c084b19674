/*!
JSON store file adapter implementation.
*/

use super::{apply_change_set, StoreAdapter};
use crate::config::StoreOptions;
use crate::record::{ChangeSet, ObjectId, Record};
use crate::{DataStoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Current layout version of the store document
pub const STORE_FORMAT_VERSION: u32 = 1;

/// On-disk layout of a store file
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    format_version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    records: Vec<Record>,
}

/// Store adapter keeping every record in a single JSON document
///
/// Each commit rewrites the whole document through a temporary file in the
/// same directory, so a failed write never leaves a torn store behind.
///
/// # Example
/// ```rust,no_run
/// use datastore_core::config::StoreOptions;
/// use datastore_core::storage::{JsonFileStore, StoreAdapter};
///
/// let store = JsonFileStore::open("/var/lib/places/LocalStore/store.json", &StoreOptions::default())?;
/// let places = store.load_records("Place")?;
/// # Ok::<(), datastore_core::DataStoreError>(())
/// ```
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: BTreeMap<ObjectId, Record>,
    read_only: bool,
    create_directories: bool,
}

impl JsonFileStore {
    /// Attach the store file at `path`, creating it when missing
    ///
    /// # Arguments
    /// * `path` - Location of the store file
    /// * `options` - Attach options (read-only, directory creation)
    ///
    /// # Returns
    /// The attached store, or `StoreAttach` when the file can not be read,
    /// parsed or created
    pub fn open<P: AsRef<Path>>(path: P, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path,
            records: BTreeMap::new(),
            read_only: options.read_only,
            create_directories: options.create_directories,
        };

        if store.path.exists() {
            store.records = read_document(&store.path)?;
            info!(
                path = %store.path.display(),
                records = store.records.len(),
                "Attached existing store file"
            );
        } else if store.read_only {
            return Err(DataStoreError::store_attach(format!(
                "read-only store {} does not exist",
                store.path.display()
            )));
        } else {
            store
                .write_document(&store.path)
                .map_err(|e| DataStoreError::store_attach(e.to_string()))?;
            info!(path = %store.path.display(), "Created new store file");
        }

        Ok(store)
    }

    /// Put an empty store file at `path`, replacing whatever is there
    ///
    /// The empty document is swapped in atomically; on failure the previous
    /// file is left as it was.
    pub fn create<P: AsRef<Path>>(path: P, options: &StoreOptions) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            records: BTreeMap::new(),
            read_only: options.read_only,
            create_directories: options.create_directories,
        };
        if store.read_only {
            return Err(DataStoreError::storage(format!(
                "Store {} is read-only",
                store.path.display()
            )));
        }

        store.write_document(&store.path)?;
        info!(path = %store.path.display(), "Created empty store file");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists, creating it if allowed
    fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if !self.create_directories {
                    return Err(DataStoreError::storage(format!(
                        "Directory {} does not exist",
                        parent.display()
                    )));
                }
                fs::create_dir_all(parent).map_err(|e| {
                    DataStoreError::storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Serialize `self.records` to `path` atomically
    fn write_document(&self, path: &Path) -> Result<()> {
        self.write_records(path, &self.records)
    }

    fn write_records(&self, path: &Path, records: &BTreeMap<ObjectId, Record>) -> Result<()> {
        self.ensure_parent_dir(path)?;

        let document = StoreDocument {
            format_version: STORE_FORMAT_VERSION,
            saved_at: Utc::now(),
            records: records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&directory).map_err(|e| {
            DataStoreError::storage(format!(
                "Failed to stage store file in {}: {}",
                directory.display(),
                e
            ))
        })?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| {
            DataStoreError::storage(format!(
                "Failed to write store file {}: {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<BTreeMap<ObjectId, Record>> {
    let contents = fs::read(path).map_err(|e| {
        DataStoreError::store_attach(format!("Failed to read store {}: {}", path.display(), e))
    })?;
    let document: StoreDocument = serde_json::from_slice(&contents).map_err(|e| {
        DataStoreError::store_attach(format!("Failed to parse store {}: {}", path.display(), e))
    })?;
    if document.format_version > STORE_FORMAT_VERSION {
        return Err(DataStoreError::store_attach(format!(
            "Store {} uses format version {}, newest supported is {}",
            path.display(),
            document.format_version,
            STORE_FORMAT_VERSION
        )));
    }
    Ok(document.records.into_iter().map(|r| (r.id, r)).collect())
}

impl StoreAdapter for JsonFileStore {
    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn load_records(&self, entity: &str) -> Result<Vec<Record>> {
        Ok(self
            .records
            .values()
            .filter(|r| r.entity == entity)
            .cloned()
            .collect())
    }

    fn load_record(&self, id: ObjectId) -> Result<Option<Record>> {
        Ok(self.records.get(&id).cloned())
    }

    fn commit(&mut self, changes: &ChangeSet) -> Result<()> {
        if self.read_only {
            return Err(DataStoreError::storage(format!(
                "Store {} is read-only",
                self.path.display()
            )));
        }

        let mut next = self.records.clone();
        apply_change_set(&mut next, changes);
        self.write_records(&self.path, &next)?;
        self.records = next;

        debug!(
            path = %self.path.display(),
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "Committed change set"
        );
        Ok(())
    }

    fn relocate(&mut self, destination: &Path) -> Result<()> {
        if destination == self.path {
            return Ok(());
        }
        self.write_document(destination)?;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        info!(
            from = %self.path.display(),
            to = %destination.display(),
            "Relocated store file"
        );
        self.path = destination.to_path_buf();
        Ok(())
    }
}
