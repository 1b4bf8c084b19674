//! Configuration module for persistent store selection and settings
//!
//! This module provides configuration structures and enums for selecting
//! the backend behind the writer context (in-memory or a JSON store file)
//! and configuring how it is opened.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// URI scheme selecting the in-memory backend
pub const MEMORY_URI: &str = "memory://";

/// Enumeration of supported persistent store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    /// Volatile store, discarded with the data store
    InMemory,
    /// Single JSON document on the local filesystem
    JsonFile,
}

/// How unique-constraint conflicts are resolved when the writer context saves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Fail the save with a constraint conflict
    Error,
    /// The in-memory change wins and the conflicting stored object is removed
    #[default]
    ObjectTrump,
    /// The stored object wins and the in-memory insert is dropped
    StoreTrump,
}

/// Options applied when the persistent store is attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    pub merge_policy: MergePolicy,
    /// Reject every commit to the persistent store
    pub read_only: bool,
    /// Create missing parent directories of the store file
    pub create_directories: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::default(),
            read_only: false,
            create_directories: true,
        }
    }
}

/// Configuration structure for the persistent store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// The backend to use
    pub backend: StoreBackend,
    /// Store file location (required for the JSON file backend)
    pub location: Option<PathBuf>,
    pub options: StoreOptions,
}

impl StoreConfig {
    /// Create a configuration for a volatile in-memory store
    pub fn in_memory() -> Self {
        StoreConfig {
            backend: StoreBackend::InMemory,
            location: None,
            options: StoreOptions::default(),
        }
    }

    /// Create a configuration for a JSON store file at `path`
    pub fn json_file<P: Into<PathBuf>>(path: P) -> Self {
        StoreConfig {
            backend: StoreBackend::JsonFile,
            location: Some(path.into()),
            options: StoreOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.options.merge_policy = merge_policy;
        self
    }

    /// Parse a store URI and create the matching configuration
    ///
    /// Supports formats:
    /// - `memory://` for the in-memory store
    /// - `/local/path/store.json` or `./relative/store.json` for a store file
    pub fn from_uri(uri: &str) -> Result<StoreConfig, crate::DataStoreError> {
        if let Some(rest) = uri.strip_prefix(MEMORY_URI) {
            if !rest.is_empty() {
                return Err(crate::DataStoreError::validation(format!(
                    "Invalid memory URI: unexpected path '{rest}'"
                )));
            }
            return Ok(StoreConfig::in_memory());
        }

        if uri.trim().is_empty() {
            return Err(crate::DataStoreError::validation(
                "Invalid store URI: empty path",
            ));
        }
        Ok(StoreConfig::json_file(uri))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        match self.backend {
            StoreBackend::JsonFile => match &self.location {
                Some(path) if !path.as_os_str().is_empty() => {}
                _ => {
                    return Err(crate::DataStoreError::validation(
                        "JSON file backend requires a store location",
                    ));
                }
            },
            StoreBackend::InMemory => {
                if self.location.is_some() {
                    return Err(crate::DataStoreError::validation(
                        "In-memory backend does not take a location",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}
