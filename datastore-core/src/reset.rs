/*!
Store reset and batch deletion.
*/

use crate::config::{StoreConfig, StoreOptions};
use crate::events::StoreEvent;
use crate::record::ChangeSet;
use crate::storage::create_store;
use crate::store::DataStore;
use crate::{DataStoreError, Result};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// How the recreated store is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreResetOption {
    /// Reuse the options the current store was attached with
    #[default]
    CopyExisting,
    /// Start over with default options
    Clear,
}

impl DataStore {
    /// Replace the persistent store with an empty one at the same location
    pub fn reset_store(&self) -> Result<()> {
        self.reset_store_with(StoreResetOption::CopyExisting)
    }

    /// Replace the persistent store with an empty one configured by `option`
    ///
    /// The empty store is built before the current one is let go, so a
    /// failed reset leaves the store, its options and every context as they
    /// were. Once the swap succeeds every context is reset and unsaved
    /// changes are lost.
    pub fn reset_store_with(&self, option: StoreResetOption) -> Result<()> {
        let current = self.topology.config();
        let options = match option {
            StoreResetOption::CopyExisting => current.options.clone(),
            StoreResetOption::Clear => StoreOptions::default(),
        };
        let next = StoreConfig {
            backend: current.backend,
            location: self.store_location(),
            options: options.clone(),
        };

        let writer = self.topology.writer();
        writer.perform_and_wait(move |writer| {
            writer.with_store(|store| {
                *store = create_store(&next)?;
                Ok(())
            })
        })??;
        writer.set_merge_policy(options.merge_policy);
        self.topology.set_options(options);
        self.topology.reset_all();

        info!(location = ?self.store_location(), ?option, "Persistent store reset");
        self.events.publish(StoreEvent::StoreReset);
        Ok(())
    }

    /// Delete every stored object of the named entities
    ///
    /// Deletion goes straight to the persistent store, bypassing the context
    /// buffers, and all contexts are reset afterwards. Entities that could not
    /// be cleared are reported together in `FailedEntityDeletion`.
    pub fn delete_all_objects(&self, entity_names: &[&str]) -> Result<()> {
        let names: Vec<String> = entity_names.iter().map(|n| n.to_string()).collect();

        let failures = self.topology.writer().perform_and_wait(move |writer| {
            let mut failures = BTreeMap::new();
            for name in names {
                let outcome = writer.schema().require_entity(&name).map(|_| ()).and_then(|_| {
                    writer.with_store(|store| {
                        let deleted = store.load_records(&name)?.into_iter().map(|r| r.id).collect();
                        store.commit(&ChangeSet {
                            deleted,
                            ..Default::default()
                        })
                    })
                });
                if let Err(error) = outcome {
                    warn!(entity = %name, %error, "Could not delete objects");
                    failures.insert(name, error.to_string());
                }
            }
            failures
        })?;

        self.topology.reset_all();
        if failures.is_empty() {
            info!(entities = ?entity_names, "Deleted all objects");
            Ok(())
        } else {
            Err(DataStoreError::FailedEntityDeletion { failures })
        }
    }
}
