/*!
Duplicate removal on the writer context.
*/

use crate::context::ManagedContext;
use crate::record::{FetchRequest, Predicate, Record, SortDescriptor, Value};
use crate::store::DataStore;
use crate::{DataStoreError, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Which of two objects sharing a key is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateResolution {
    DeleteLeft,
    DeleteRight,
}

impl DataStore {
    /// Delete objects of `entity` that share the value of `key`
    ///
    /// Objects with the same key are handed to `resolver` pairwise, the
    /// survivor of each pair meeting the next duplicate. Deletions are made in
    /// the writer context and become durable with the next save. Objects
    /// without a value for `key` are never considered duplicates.
    ///
    /// # Returns
    /// The number of deleted objects
    pub fn remove_duplicates<F>(&self, entity: &str, key: &str, resolver: F) -> Result<usize>
    where
        F: FnMut(&Record, &Record) -> DuplicateResolution + Send + 'static,
    {
        let description = self.schema().require_entity(entity)?;
        if description.attribute_named(key).is_none() {
            return Err(DataStoreError::validation(format!(
                "{entity} has no attribute named {key}"
            )));
        }

        let entity = entity.to_string();
        let key = key.to_string();
        self.topology
            .writer()
            .perform_and_wait(move |writer| remove_duplicates_in(writer, &entity, &key, resolver))?
    }
}

fn remove_duplicates_in<F>(writer: &ManagedContext, entity: &str, key: &str, mut resolver: F) -> Result<usize>
where
    F: FnMut(&Record, &Record) -> DuplicateResolution,
{
    let request = FetchRequest::new(entity).sorted_by(SortDescriptor::ascending(key));
    let mut occurrences: BTreeMap<String, (Value, usize)> = BTreeMap::new();
    for record in writer.fetch(&request)? {
        match record.get(key) {
            None | Some(Value::Null) => {}
            Some(value) => {
                occurrences
                    .entry(value.to_string())
                    .or_insert_with(|| (value.clone(), 0))
                    .1 += 1;
            }
        }
    }

    let mut deleted = 0;
    for (value, _) in occurrences.into_values().filter(|(_, count)| *count > 1) {
        let same_value = FetchRequest::new(entity).with_predicate(Predicate::equals(key, value));
        let mut candidates = writer.fetch(&same_value)?.into_iter();
        let Some(mut survivor) = candidates.next() else {
            continue;
        };
        for candidate in candidates {
            match resolver(&survivor, &candidate) {
                DuplicateResolution::DeleteLeft => {
                    writer.delete_object(survivor.id)?;
                    survivor = candidate;
                }
                DuplicateResolution::DeleteRight => {
                    writer.delete_object(candidate.id)?;
                }
            }
            deleted += 1;
        }
    }

    debug!(entity, key, deleted, "Removed duplicate objects");
    Ok(deleted)
}
