/*!
Persistent store adapters.

This module defines the persistent store abstraction (port) owned by the
writer context and the concrete implementations (adapters). Only the writer
context ever holds an adapter; main and background contexts reach durable data
exclusively through it.
*/

pub mod json_file;

use crate::config::{StoreBackend, StoreConfig, StoreOptions};
use crate::record::{ChangeSet, ObjectId, Record};
use crate::{DataStoreError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use json_file::JsonFileStore;

/// Persistent store abstraction behind the writer context
///
/// This trait defines the interface that every durable backend must provide.
/// Commits are all-or-nothing: when `commit` fails, the adapter's visible
/// contents must be unchanged.
#[cfg_attr(test, mockall::automock)]
pub trait StoreAdapter: Send + Sync {
    /// Backing file, `None` for volatile stores
    fn location(&self) -> Option<PathBuf>;

    /// Load every stored record of `entity`
    ///
    /// # Returns
    /// The records, possibly empty, or an error
    fn load_records(&self, entity: &str) -> Result<Vec<Record>>;

    /// Load a single record by identity
    fn load_record(&self, id: ObjectId) -> Result<Option<Record>>;

    /// Durably apply a change set
    ///
    /// # Arguments
    /// * `changes` - Inserted and updated records are upserted, deleted ids removed
    ///
    /// # Returns
    /// Result indicating success or failure
    fn commit(&mut self, changes: &ChangeSet) -> Result<()>;

    /// Move the backing data to `destination`
    fn relocate(&mut self, destination: &Path) -> Result<()>;
}

/// Open the adapter described by `config`
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn StoreAdapter>> {
    config.validate()?;
    match config.backend {
        StoreBackend::InMemory => Ok(Box::new(MemoryStore::with_options(&config.options))),
        StoreBackend::JsonFile => {
            let location = config
                .location
                .as_deref()
                .ok_or_else(|| DataStoreError::store_attach("missing store location"))?;
            Ok(Box::new(JsonFileStore::open(location, &config.options)?))
        }
    }
}

/// Build an empty adapter for `config`, replacing any existing data
///
/// Nothing is touched unless the replacement can be put in place, so a
/// failure leaves the current backing data as it was.
pub fn create_store(config: &StoreConfig) -> Result<Box<dyn StoreAdapter>> {
    config.validate()?;
    if config.options.read_only {
        return Err(DataStoreError::storage("a read-only store can not be recreated"));
    }
    match config.backend {
        StoreBackend::InMemory => Ok(Box::new(MemoryStore::with_options(&config.options))),
        StoreBackend::JsonFile => {
            let location = config
                .location
                .as_deref()
                .ok_or_else(|| DataStoreError::storage("missing store location"))?;
            Ok(Box::new(JsonFileStore::create(location, &config.options)?))
        }
    }
}

/// Apply `changes` on top of `records`
pub(crate) fn apply_change_set(records: &mut BTreeMap<ObjectId, Record>, changes: &ChangeSet) {
    for record in changes.inserted.iter().chain(changes.updated.iter()) {
        records.insert(record.id, record.clone());
    }
    for id in &changes.deleted {
        records.remove(id);
    }
}

/// Volatile adapter keeping records in a map
///
/// Used for the in-memory backend and for unit tests; contents vanish with
/// the data store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<ObjectId, Record>,
    read_only: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: &StoreOptions) -> Self {
        Self {
            records: BTreeMap::new(),
            read_only: options.read_only,
        }
    }
}

impl StoreAdapter for MemoryStore {
    fn location(&self) -> Option<PathBuf> {
        None
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
            return Err(DataStoreError::storage("store is read-only"));
        }
        apply_change_set(&mut self.records, changes);
        Ok(())
    }

    fn relocate(&mut self, _destination: &Path) -> Result<()> {
        Err(DataStoreError::unsupported(
            "an in-memory store has no location to move",
        ))
    }
}
