/*!
The fixed three-context tree.

`main` and `background` are siblings parented to `writer`; only `writer` holds
the persistent store adapter. Each context runs on its own serial queue.
*/

use crate::config::{StoreBackend, StoreConfig, StoreOptions};
use crate::context::{ContextKind, ManagedContext};
use crate::schema::Schema;
use crate::storage::{open_store, StoreAdapter};
use crate::{DataStoreError, Result};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ContextTopology {
    main: ManagedContext,
    background: ManagedContext,
    writer: ManagedContext,
    config: RwLock<StoreConfig>,
}

impl ContextTopology {
    /// Open the store described by `config` and build the context tree on it
    ///
    /// # Returns
    /// The topology, or `StoreAttach` when the schema or store can not be used
    pub fn initialize(schema: Schema, config: StoreConfig) -> Result<Self> {
        schema
            .check()
            .and_then(|_| config.validate())
            .map_err(|e| DataStoreError::store_attach(e.to_string()))?;
        let store = open_store(&config)?;
        Self::build(Arc::new(schema), store, config)
    }

    /// Build the context tree on an already attached store adapter
    pub fn with_store(
        schema: Schema,
        store: Box<dyn StoreAdapter>,
        options: StoreOptions,
    ) -> Result<Self> {
        schema
            .check()
            .map_err(|e| DataStoreError::store_attach(e.to_string()))?;
        let location = store.location();
        let config = StoreConfig {
            backend: if location.is_some() {
                StoreBackend::JsonFile
            } else {
                StoreBackend::InMemory
            },
            location,
            options,
        };
        Self::build(Arc::new(schema), store, config)
    }

    fn build(schema: Arc<Schema>, store: Box<dyn StoreAdapter>, config: StoreConfig) -> Result<Self> {
        let writer = ManagedContext::writer(schema, store, config.options.merge_policy)?;
        let main = ManagedContext::child(ContextKind::Main, &writer)?;
        let background = ManagedContext::child(ContextKind::Background, &writer)?;

        info!(
            backend = ?config.backend,
            location = ?config.location,
            "Context topology initialized"
        );
        Ok(Self {
            main,
            background,
            writer,
            config: RwLock::new(config),
        })
    }

    pub fn main(&self) -> &ManagedContext {
        &self.main
    }

    pub fn background(&self) -> &ManagedContext {
        &self.background
    }

    pub fn writer(&self) -> &ManagedContext {
        &self.writer
    }

    pub fn context(&self, kind: ContextKind) -> &ManagedContext {
        match kind {
            ContextKind::Main => &self.main,
            ContextKind::Background => &self.background,
            ContextKind::Writer => &self.writer,
        }
    }

    pub fn schema(&self) -> &Schema {
        self.writer.schema()
    }

    /// Configuration the current store was attached with
    pub fn config(&self) -> StoreConfig {
        self.config.read().clone()
    }

    pub(crate) fn set_location(&self, location: Option<PathBuf>) {
        self.config.write().location = location;
    }

    pub(crate) fn set_options(&self, options: StoreOptions) {
        self.config.write().options = options;
    }

    /// True iff any of the three contexts has pending changes
    pub fn has_changes(&self) -> bool {
        self.main.has_changes() || self.background.has_changes() || self.writer.has_changes()
    }

    /// Discard pending changes in every context
    pub fn reset_all(&self) {
        self.main.reset();
        self.background.reset();
        self.writer.reset();
        debug!("All contexts reset");
    }
}

impl std::fmt::Debug for ContextTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTopology")
            .field("main", &self.main)
            .field("background", &self.background)
            .field("writer", &self.writer)
            .finish()
    }
}
