/*!
# DataStore Core

Three-tier context orchestration over a pluggable persistent store.

The crate keeps three object contexts in a fixed parent chain:

- **main**: serves the presentation layer, child of the writer
- **background**: runs heavy imports and edits, also a child of the writer
- **writer**: the only context that talks to the persistent store

Each context owns a serial queue. Work is submitted to a context and executes
on that context's queue, one job at a time.

## Saving

A full save walks main, then background, then writer, each stage running on
its own context's queue. Main and background push their pending changes into
the writer's buffer; the writer commits them to the store. The chain stops at
the first failing stage and the outcome is reported exactly once.

## Propagation

When main or background saves, the sibling context merges the saved changes so
that its materialized objects stay current. Saves of the writer are never
propagated.

## Usage

```rust
use datastore_core::schema::{AttributeKind, EntityDescription, Schema};
use datastore_core::DataStore;

let schema = Schema::new(vec![
    EntityDescription::new("Person")
        .required("firstName", AttributeKind::String)
        .attribute("lastName", AttributeKind::String),
]);
let store = DataStore::in_memory(schema)?;

store.perform_on_background_wait_and_save(|context| {
    context.insert_object("Person", |person| {
        person.set("firstName", "Jad");
        person.set("lastName", "Osseiran");
    })
})??;

let people = store.perform_on_main_and_wait(|context| context.find_all("Person"))??;
assert_eq!(people.len(), 1);
# Ok::<(), datastore_core::DataStoreError>(())
```
*/

pub mod config;
pub mod context;
pub mod duplicates;
pub mod entity_name;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod observability;
pub mod operations;
pub mod propagation;
pub mod queue;
pub mod record;
pub mod reset;
pub mod save;
pub mod schema;
pub mod storage;
pub mod store;
pub mod topology;


pub use config::{MergePolicy, StoreBackend, StoreConfig, StoreOptions};
pub use context::{ChangeNotification, ContextId, ContextKind, ManagedContext};
pub use duplicates::DuplicateResolution;
pub use entity_name::{resolve_entity_name, EntityNameCache};
pub use error::{DataStoreError, Result};
pub use events::{EventHub, StoreEvent};
pub use filesystem::{default_store_directory, default_store_path, StoreDirectory};
pub use observability::{init_default_observability, init_observability};
pub use propagation::ChangePropagationBridge;
pub use record::{ChangeSet, FetchRequest, ObjectId, Predicate, Record, SortDescriptor, Value};
pub use reset::StoreResetOption;
pub use save::{ContextSaveCallback, SaveCoordinator, SaveStage};
pub use schema::{AttributeKind, EntityDescription, Schema};
pub use storage::{create_store, open_store, JsonFileStore, MemoryStore, StoreAdapter};
pub use store::DataStore;
pub use topology::ContextTopology;

#[cfg(feature = "metrics")]
pub use observability::DataStoreMetrics;
