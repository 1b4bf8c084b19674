/*!
The data store: topology, save coordination and propagation wired together.
*/

use crate::config::{MergePolicy, StoreConfig, StoreOptions};
use crate::context::ManagedContext;
use crate::entity_name::EntityNameCache;
use crate::events::{EventHub, StoreEvent};
use crate::propagation::ChangePropagationBridge;
use crate::save::{ContextSaveCallback, SaveCoordinator};
use crate::schema::Schema;
use crate::storage::StoreAdapter;
use crate::topology::ContextTopology;
use crate::Result;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

/// Owner of the three contexts and everything that keeps them consistent
///
/// # Example
/// ```rust
/// use datastore_core::schema::{AttributeKind, EntityDescription, Schema};
/// use datastore_core::DataStore;
///
/// let schema = Schema::new(vec![
///     EntityDescription::new("Person").required("firstName", AttributeKind::String),
/// ]);
/// let store = DataStore::in_memory(schema)?;
///
/// store.perform_on_main_wait_and_save(|context| {
///     context.insert_object("Person", |person| person.set("firstName", "Jad"))
/// })??;
/// assert!(!store.has_changes());
/// # Ok::<(), datastore_core::DataStoreError>(())
/// ```
pub struct DataStore {
    pub(crate) topology: Arc<ContextTopology>,
    pub(crate) coordinator: SaveCoordinator,
    pub(crate) events: Arc<EventHub>,
    pub(crate) entity_names: EntityNameCache,
    bridge: Arc<ChangePropagationBridge>,
}

impl DataStore {
    /// Open the store described by `config`
    pub fn open(schema: Schema, config: StoreConfig) -> Result<Self> {
        Ok(Self::from_topology(ContextTopology::initialize(schema, config)?))
    }

    pub fn in_memory(schema: Schema) -> Result<Self> {
        Self::open(schema, StoreConfig::in_memory())
    }

    /// Build a store on an already attached adapter
    pub fn with_store(
        schema: Schema,
        store: Box<dyn StoreAdapter>,
        options: StoreOptions,
    ) -> Result<Self> {
        Ok(Self::from_topology(ContextTopology::with_store(
            schema, store, options,
        )?))
    }

    fn from_topology(topology: ContextTopology) -> Self {
        let topology = Arc::new(topology);
        let events = Arc::new(EventHub::new());
        let bridge = ChangePropagationBridge::install(
            topology.main(),
            topology.background(),
            Arc::clone(&events),
        );
        Self {
            coordinator: SaveCoordinator::new(&topology),
            topology,
            events,
            entity_names: EntityNameCache::new(),
            bridge,
        }
    }

    /// Context for interactive work, bound to the main queue
    pub fn main_context(&self) -> &ManagedContext {
        self.topology.main()
    }

    /// Context for bulk work, bound to the background queue
    pub fn background_context(&self) -> &ManagedContext {
        self.topology.background()
    }

    pub fn schema(&self) -> &Schema {
        self.topology.schema()
    }

    pub fn config(&self) -> StoreConfig {
        self.topology.config()
    }

    /// Location of the store file, `None` for an in-memory store
    pub fn store_location(&self) -> Option<PathBuf> {
        self.topology.writer().store_location()
    }

    pub fn save_coordinator(&self) -> &SaveCoordinator {
        &self.coordinator
    }

    /// True iff any context holds unsaved changes
    pub fn has_changes(&self) -> bool {
        self.topology.has_changes()
    }

    /// Discard unsaved changes in every context
    pub fn reset_contexts(&self) {
        self.topology.reset_all();
    }

    /// Asynchronous full save; see [`SaveCoordinator::save`]
    pub fn save<F>(&self, on_context_save: Option<ContextSaveCallback>, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.coordinator.save(on_context_save, completion);
    }

    /// Blocking full save; see [`SaveCoordinator::save_and_wait`]
    pub fn save_and_wait(&self, on_context_save: Option<ContextSaveCallback>) -> Result<()> {
        self.coordinator.save_and_wait(on_context_save)
    }

    /// Receive every store event published from now on
    pub fn subscribe(&self) -> mpsc::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.topology.writer().merge_policy()
    }

    /// Change how the writer resolves unique-constraint conflicts
    pub fn set_merge_policy(&self, policy: MergePolicy) {
        self.topology.writer().set_merge_policy(policy);
        let mut options = self.topology.config().options;
        options.merge_policy = policy;
        self.topology.set_options(options);
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        self.bridge.uninstall();
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("topology", &self.topology)
            .finish()
    }
}
