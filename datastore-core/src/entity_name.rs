/*!
Resolution of client type names to schema entity names.
*/

use crate::schema::Schema;
use crate::store::DataStore;
use crate::{DataStoreError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Memoized class name to entity name lookups, owned by one store
#[derive(Debug, Default)]
pub struct EntityNameCache {
    names: Mutex<HashMap<(String, Option<String>), String>>,
}

impl EntityNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entity name for `class_name`, resolving it against `schema` on a miss
    pub fn resolve(&self, schema: &Schema, class_name: &str, prefix: Option<&str>) -> Result<String> {
        let key = (class_name.to_string(), prefix.map(str::to_string));
        if let Some(name) = self.names.lock().get(&key) {
            return Ok(name.clone());
        }

        let name = resolve_entity_name(schema, class_name, prefix)?;
        self.names.lock().insert(key, name.clone());
        Ok(name)
    }

    pub fn clear(&self) {
        self.names.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}

/// Last path segment of a type name, without generic arguments
fn unqualified(class_name: &str) -> &str {
    let base = class_name.split('<').next().unwrap_or(class_name);
    let base = base.rsplit("::").next().unwrap_or(base);
    base.rsplit('.').next().unwrap_or(base)
}

/// Find the single entity that `class_name` stands for
///
/// An entity matches when its class name equals the full or unqualified type
/// name, or when its entity name equals the unqualified type name with or
/// without `prefix`.
pub fn resolve_entity_name(schema: &Schema, class_name: &str, prefix: Option<&str>) -> Result<String> {
    let short = unqualified(class_name);
    let unprefixed = prefix
        .and_then(|prefix| short.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(short);

    let matches: Vec<String> = schema
        .entities
        .iter()
        .filter(|entity| {
            let by_class = entity
                .class_name
                .as_deref()
                .map_or(false, |class| class == class_name || class == short);
            by_class || entity.name == short || entity.name == unprefixed
        })
        .map(|entity| entity.name.clone())
        .collect();

    match matches.as_slice() {
        [name] => Ok(name.clone()),
        _ => Err(DataStoreError::InvalidEntityName {
            class_name: class_name.to_string(),
            matches,
        }),
    }
}

impl DataStore {
    /// Entity name for a (possibly qualified) class name
    pub fn entity_name_for_class(&self, class_name: &str, prefix: Option<&str>) -> Result<String> {
        self.entity_names.resolve(self.schema(), class_name, prefix)
    }

    /// Entity name for the Rust type `T`
    pub fn entity_name_for<T: ?Sized>(&self) -> Result<String> {
        self.entity_name_for_class(std::any::type_name::<T>(), None)
    }

    pub fn clear_cached_entity_names(&self) {
        self.entity_names.clear();
    }
}
