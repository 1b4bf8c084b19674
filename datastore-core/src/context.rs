/*!
Managed contexts: change-tracking buffers bound to a serial queue.

A context buffers inserts, updates and deletes until it is saved. Saving a
child context pushes its buffer into the parent's buffer; saving the writer
context (the only one holding a store adapter) commits to durable storage.

What a context sees is layered:

1. its parent's view (the writer sees the store plus its own buffer),
2. the copies of objects it has already materialized, which stay as they were
   read until a merge refreshes them,
3. its own pending inserts, updates and deletes.
*/

use crate::config::MergePolicy;
use crate::queue::SerialQueue;
use crate::record::{ChangeSet, FetchRequest, ObjectId, Predicate, Record, Value};
use crate::schema::Schema;
use crate::storage::StoreAdapter;
use crate::{DataStoreError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Role of a context in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Main,
    Background,
    Writer,
}

impl ContextKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Background => "background",
            Self::Writer => "writer",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of one context instance
///
/// Freshly allocated for every context, so two contexts never compare equal
/// even when they share a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Emitted after a context saved a non-empty set of changes
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub origin: ContextId,
    pub kind: ContextKind,
    pub changes: ChangeSet,
}

/// Callback invoked after every successful, non-empty save of a context
pub type SaveObserver = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

#[derive(Debug, Default)]
struct PendingChanges {
    inserted: BTreeMap<ObjectId, Record>,
    updated: BTreeMap<ObjectId, Record>,
    deleted: BTreeSet<ObjectId>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    fn to_change_set(&self) -> ChangeSet {
        ChangeSet {
            inserted: self.inserted.values().cloned().collect(),
            updated: self.updated.values().cloned().collect(),
            deleted: self.deleted.iter().copied().collect(),
        }
    }

    fn clear(&mut self) {
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }
}

#[derive(Debug, Default)]
struct ContextState {
    pending: PendingChanges,
    registered: HashMap<ObjectId, Record>,
    /// Bumped by every change to `pending` other than clearing it
    generation: u64,
}

enum Parent {
    Store(RwLock<Box<dyn StoreAdapter>>),
    Context(ManagedContext),
}

struct ContextInner {
    id: ContextId,
    kind: ContextKind,
    queue: SerialQueue,
    schema: Arc<Schema>,
    parent: Parent,
    state: Mutex<ContextState>,
    merge_policy: RwLock<MergePolicy>,
    observer: RwLock<Option<SaveObserver>>,
}

/// Handle to a context; clones refer to the same context
#[derive(Clone)]
pub struct ManagedContext {
    inner: Arc<ContextInner>,
}

/// Non-owning handle to a context
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<ManagedContext> {
        self.inner.upgrade().map(|inner| ManagedContext { inner })
    }
}

impl ManagedContext {
    /// Create the writer context, the sole owner of `store`
    pub(crate) fn writer(
        schema: Arc<Schema>,
        store: Box<dyn StoreAdapter>,
        merge_policy: MergePolicy,
    ) -> Result<Self> {
        Self::build(ContextKind::Writer, schema, Parent::Store(RwLock::new(store)), merge_policy)
    }

    /// Create a context whose saves push into `parent`
    pub(crate) fn child(kind: ContextKind, parent: &ManagedContext) -> Result<Self> {
        let schema = Arc::clone(&parent.inner.schema);
        let merge_policy = parent.merge_policy();
        Self::build(kind, schema, Parent::Context(parent.clone()), merge_policy)
    }

    fn build(
        kind: ContextKind,
        schema: Arc<Schema>,
        parent: Parent,
        merge_policy: MergePolicy,
    ) -> Result<Self> {
        let inner = ContextInner {
            id: ContextId::new(),
            kind,
            queue: SerialQueue::new(kind.label())?,
            schema,
            parent,
            state: Mutex::new(ContextState::default()),
            merge_policy: RwLock::new(merge_policy),
            observer: RwLock::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// True when called from this context's queue
    pub fn is_on_queue(&self) -> bool {
        self.inner.queue.is_current()
    }

    /// Enqueue `work` on this context's queue
    pub fn perform<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&ManagedContext) + Send + 'static,
    {
        let context = self.clone();
        self.inner.queue.dispatch(move || work(&context))
    }

    /// Run `work` on this context's queue and wait for its result
    ///
    /// Must not be called from the context's own queue; that fails with
    /// `ReentrantWait`.
    pub fn perform_and_wait<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&ManagedContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let context = self.clone();
        self.inner.queue.dispatch_and_wait(move || work(&context))
    }

    /// True iff the context holds an unsaved insert, update or delete
    pub fn has_changes(&self) -> bool {
        !self.inner.state.lock().pending.is_empty()
    }

    /// Snapshot of the unsaved changes
    pub fn pending_changes(&self) -> ChangeSet {
        self.inner.state.lock().pending.to_change_set()
    }

    /// Discard pending changes and every materialized object
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.pending.clear();
        state.registered.clear();
        debug!(context = %self.inner.kind, "Context reset");
    }

    /// Reset after a save that observed `generation`
    ///
    /// Materialized objects are always dropped. Pending changes are only
    /// dropped when nothing was recorded since that save, so work queued by
    /// another caller in the meantime survives for its own save.
    pub(crate) fn reset_saved(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        state.registered.clear();
        if state.generation == generation {
            state.pending.clear();
            debug!(context = %self.inner.kind, "Context reset");
        } else {
            debug!(
                context = %self.inner.kind,
                saved = generation,
                current = state.generation,
                "Context reset, keeping changes recorded after the save"
            );
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        *self.inner.merge_policy.read()
    }

    pub fn set_merge_policy(&self, policy: MergePolicy) {
        *self.inner.merge_policy.write() = policy;
    }

    pub(crate) fn set_save_observer(&self, observer: Option<SaveObserver>) {
        *self.inner.observer.write() = observer;
    }

    /// Insert a new object of `entity`, filled in by `configure`
    pub fn insert_object<F>(&self, entity: &str, configure: F) -> Result<Record>
    where
        F: FnOnce(&mut Record),
    {
        self.inner.schema.require_entity(entity)?;
        let mut record = Record::new(entity);
        configure(&mut record);
        let mut state = self.inner.state.lock();
        state.pending.inserted.insert(record.id, record.clone());
        state.generation += 1;
        Ok(record)
    }

    /// Modify a visible object through `modify`
    pub fn update_object<F>(&self, id: ObjectId, modify: F) -> Result<Record>
    where
        F: FnOnce(&mut Record),
    {
        let mut record = self.resolve(id)?.ok_or(DataStoreError::ObjectNotFound(id))?;
        modify(&mut record);
        record.id = id;

        let mut state = self.inner.state.lock();
        if let Some(inserted) = state.pending.inserted.get_mut(&id) {
            *inserted = record.clone();
        } else {
            state.pending.updated.insert(id, record.clone());
        }
        state.generation += 1;
        Ok(record)
    }

    pub fn delete_object(&self, id: ObjectId) -> Result<()> {
        if self.resolve(id)?.is_none() {
            return Err(DataStoreError::ObjectNotFound(id));
        }

        let mut state = self.inner.state.lock();
        if state.pending.inserted.remove(&id).is_none() {
            state.pending.updated.remove(&id);
            state.pending.deleted.insert(id);
        }
        state.registered.remove(&id);
        state.generation += 1;
        Ok(())
    }

    /// Object with identity `id`, if visible from this context
    pub fn object(&self, id: ObjectId) -> Result<Option<Record>> {
        let record = self.resolve(id)?;
        if let Some(record) = &record {
            self.register(std::slice::from_ref(record));
        }
        Ok(record)
    }

    /// Execute a fetch request against this context's view
    ///
    /// # Returns
    /// The matching records, possibly empty
    pub fn fetch(&self, request: &FetchRequest) -> Result<Vec<Record>> {
        self.inner.schema.require_entity(&request.entity)?;
        let records = request.apply(self.view(&request.entity)?.into_values());
        self.register(&records);
        Ok(records)
    }

    pub fn count(&self, request: &FetchRequest) -> Result<usize> {
        self.inner.schema.require_entity(&request.entity)?;
        Ok(request.apply(self.view(&request.entity)?.into_values()).len())
    }

    pub fn find_all(&self, entity: &str) -> Result<Vec<Record>> {
        self.fetch(&FetchRequest::new(entity))
    }

    /// First object matching `predicate`, or a new one filled in by `configure`
    pub fn find_or_insert<F>(&self, entity: &str, predicate: Predicate, configure: F) -> Result<Record>
    where
        F: FnOnce(&mut Record),
    {
        let request = FetchRequest::new(entity)
            .with_predicate(predicate)
            .with_limit(1);
        if let Some(existing) = self.fetch(&request)?.into_iter().next() {
            return Ok(existing);
        }
        self.insert_object(entity, configure)
    }

    /// Save pending changes one level up
    ///
    /// A child context pushes its changes into its parent's buffer. The writer
    /// context resolves unique constraints and commits to the store. On
    /// failure the pending changes are left untouched. A save with nothing
    /// pending succeeds without notifying.
    pub fn save(&self) -> Result<()> {
        self.save_tracked().1
    }

    /// Save, also returning the change generation the save started from
    ///
    /// The generation is read under the same lock the save holds, whether or
    /// not the save succeeds. Handing it to `reset_saved` later discards only
    /// what this save saw.
    pub(crate) fn save_tracked(&self) -> (u64, Result<()>) {
        let mut state = self.inner.state.lock();
        let generation = state.generation;
        let saved = match &self.inner.parent {
            Parent::Context(parent) => self.save_into_parent(&mut state, parent),
            Parent::Store(store) => self.save_to_store(&mut state, store),
        };
        drop(state);

        let result = saved.map(|notification| {
            if let Some(notification) = notification {
                let observer = self.inner.observer.read().clone();
                if let Some(observer) = observer {
                    observer(&notification);
                }
            }
        });
        (generation, result)
    }

    /// Refresh materialized objects from a sibling's saved changes
    pub fn merge_changes(&self, notification: &ChangeNotification) {
        let mut state = self.inner.state.lock();
        let changes = &notification.changes;
        for record in changes.inserted.iter().chain(changes.updated.iter()) {
            if let Some(copy) = state.registered.get_mut(&record.id) {
                *copy = record.clone();
            }
        }
        for id in &changes.deleted {
            state.registered.remove(id);
            state.pending.updated.remove(id);
        }
        debug!(
            context = %self.inner.kind,
            from = %notification.kind,
            objects = changes.len(),
            "Merged changes"
        );
    }

    /// Location of the backing store, writer only
    pub fn store_location(&self) -> Option<PathBuf> {
        match &self.inner.parent {
            Parent::Store(store) => store.read().location(),
            Parent::Context(parent) => parent.store_location(),
        }
    }

    /// Run `f` with exclusive access to the store adapter slot
    pub(crate) fn with_store<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Box<dyn StoreAdapter>) -> Result<R>,
    {
        match &self.inner.parent {
            Parent::Store(store) => f(&mut *store.write()),
            Parent::Context(_) => Err(DataStoreError::unsupported(format!(
                "the {} context does not own the persistent store",
                self.inner.kind
            ))),
        }
    }

    fn save_into_parent(
        &self,
        state: &mut ContextState,
        parent: &ManagedContext,
    ) -> Result<Option<ChangeNotification>> {
        if state.pending.is_empty() {
            return Ok(None);
        }
        let changes = state.pending.to_change_set();
        self.validate(&changes)?;

        parent.absorb(&changes);
        for record in changes.inserted.iter().chain(changes.updated.iter()) {
            state.registered.insert(record.id, record.clone());
        }
        for id in &changes.deleted {
            state.registered.remove(id);
        }
        state.pending.clear();

        debug!(
            context = %self.inner.kind,
            parent = %parent.inner.kind,
            objects = changes.len(),
            "Pushed changes to parent context"
        );
        Ok(Some(self.notification(changes)))
    }

    fn save_to_store(
        &self,
        state: &mut ContextState,
        store: &RwLock<Box<dyn StoreAdapter>>,
    ) -> Result<Option<ChangeNotification>> {
        if state.pending.is_empty() {
            return Ok(None);
        }
        let changes = state.pending.to_change_set();
        self.validate(&changes)?;

        let mut store = store.write();
        let resolved = resolve_constraints(
            &self.inner.schema,
            &**store,
            changes,
            self.merge_policy(),
        )?;
        store.commit(&resolved)?;
        drop(store);

        state.pending.clear();
        state.registered.clear();

        debug!(
            inserted = resolved.inserted.len(),
            updated = resolved.updated.len(),
            deleted = resolved.deleted.len(),
            "Committed writer context to the persistent store"
        );
        Ok(Some(self.notification(resolved)))
    }

    fn notification(&self, changes: ChangeSet) -> ChangeNotification {
        ChangeNotification {
            origin: self.inner.id,
            kind: self.inner.kind,
            changes,
        }
    }

    fn validate(&self, changes: &ChangeSet) -> Result<()> {
        for record in changes.inserted.iter().chain(changes.updated.iter()) {
            self.inner.schema.validate(record)?;
        }
        Ok(())
    }

    /// Fold a child's saved changes into this context's buffer
    fn absorb(&self, changes: &ChangeSet) {
        let mut state = self.inner.state.lock();
        for record in &changes.inserted {
            state.pending.deleted.remove(&record.id);
            state.pending.inserted.insert(record.id, record.clone());
        }
        for record in &changes.updated {
            if let Some(inserted) = state.pending.inserted.get_mut(&record.id) {
                *inserted = record.clone();
            } else {
                state.pending.updated.insert(record.id, record.clone());
            }
        }
        for id in &changes.deleted {
            if state.pending.inserted.remove(id).is_none() {
                state.pending.updated.remove(id);
                state.pending.deleted.insert(*id);
            }
            state.registered.remove(id);
        }
        state.generation += 1;
    }

    /// Remember `records` as materialized; only child contexts keep copies
    fn register(&self, records: &[Record]) {
        if matches!(self.inner.parent, Parent::Store(_)) {
            return;
        }
        let mut state = self.inner.state.lock();
        for record in records {
            if !state.pending.inserted.contains_key(&record.id)
                && !state.pending.updated.contains_key(&record.id)
            {
                state.registered.insert(record.id, record.clone());
            }
        }
    }

    fn view(&self, entity: &str) -> Result<BTreeMap<ObjectId, Record>> {
        let mut records: BTreeMap<ObjectId, Record> = match &self.inner.parent {
            Parent::Store(store) => store
                .read()
                .load_records(entity)?
                .into_iter()
                .map(|r| (r.id, r))
                .collect(),
            Parent::Context(parent) => parent.view(entity)?,
        };

        let state = self.inner.state.lock();
        for (id, record) in records.iter_mut() {
            if let Some(pending) = state.pending.updated.get(id) {
                *record = pending.clone();
            } else if let Some(copy) = state.registered.get(id) {
                *record = copy.clone();
            }
        }
        for record in state.pending.inserted.values() {
            if record.entity == entity {
                records.insert(record.id, record.clone());
            }
        }
        for id in &state.pending.deleted {
            records.remove(id);
        }
        Ok(records)
    }

    fn resolve(&self, id: ObjectId) -> Result<Option<Record>> {
        let base = match &self.inner.parent {
            Parent::Store(store) => store.read().load_record(id)?,
            Parent::Context(parent) => parent.resolve(id)?,
        };

        let state = self.inner.state.lock();
        if let Some(inserted) = state.pending.inserted.get(&id) {
            return Ok(Some(inserted.clone()));
        }
        if base.is_none() || state.pending.deleted.contains(&id) {
            return Ok(None);
        }
        Ok(state
            .pending
            .updated
            .get(&id)
            .or_else(|| state.registered.get(&id))
            .cloned()
            .or(base))
    }
}

impl fmt::Debug for ManagedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedContext")
            .field("kind", &self.inner.kind)
            .field("id", &self.inner.id)
            .finish()
    }
}

fn key_text(key: Vec<Value>) -> String {
    Value::Array(key).to_string()
}

/// Apply the unique constraints of `schema` to a writer change set
fn resolve_constraints(
    schema: &Schema,
    store: &dyn StoreAdapter,
    mut changes: ChangeSet,
    policy: MergePolicy,
) -> Result<ChangeSet> {
    let inserted_ids: HashSet<ObjectId> = changes.inserted.iter().map(|r| r.id).collect();
    let touched: HashSet<ObjectId> = changes
        .inserted
        .iter()
        .chain(changes.updated.iter())
        .map(|r| r.id)
        .chain(changes.deleted.iter().copied())
        .collect();
    let entities: BTreeSet<String> = changes
        .inserted
        .iter()
        .chain(changes.updated.iter())
        .map(|r| r.entity.clone())
        .collect();

    let mut evicted: Vec<ObjectId> = Vec::new();
    let mut dropped: HashSet<ObjectId> = HashSet::new();

    for entity_name in entities {
        let Some(entity) = schema.entity(&entity_name) else {
            continue;
        };
        if entity.unique_by.is_empty() {
            continue;
        }

        let mut stored: HashMap<String, ObjectId> = store
            .load_records(&entity_name)?
            .into_iter()
            .filter(|r| !touched.contains(&r.id))
            .filter_map(|r| entity.unique_key(&r).map(|key| (key_text(key), r.id)))
            .collect();
        let mut claimed: HashMap<String, ObjectId> = HashMap::new();

        let candidates = changes
            .inserted
            .iter()
            .chain(changes.updated.iter())
            .filter(|r| r.entity == entity_name);
        for record in candidates {
            let Some(key) = entity.unique_key(record) else {
                continue;
            };
            let key = key_text(key);
            let conflict = stored.get(&key).or_else(|| claimed.get(&key)).copied();

            match (conflict, policy) {
                (None, _) => {
                    claimed.insert(key, record.id);
                }
                (Some(_), MergePolicy::Error) => {
                    return Err(DataStoreError::ConstraintConflict {
                        entity: entity_name.clone(),
                        attributes: entity.unique_by.clone(),
                        value: key,
                    });
                }
                (Some(other), MergePolicy::ObjectTrump) => {
                    warn!(entity = %entity_name, key = %key, evicted = %other, "Unique constraint resolved in favour of the saved object");
                    evicted.push(other);
                    stored.remove(&key);
                    claimed.insert(key, record.id);
                }
                (Some(other), MergePolicy::StoreTrump) => {
                    warn!(entity = %entity_name, key = %key, kept = %other, "Unique constraint resolved in favour of the stored object");
                    dropped.insert(record.id);
                }
            }
        }
    }

    if evicted.is_empty() && dropped.is_empty() {
        return Ok(changes);
    }

    let evicted_set: HashSet<ObjectId> = evicted.iter().copied().collect();
    changes
        .inserted
        .retain(|r| !dropped.contains(&r.id) && !evicted_set.contains(&r.id));
    changes
        .updated
        .retain(|r| !dropped.contains(&r.id) && !evicted_set.contains(&r.id));
    for id in evicted {
        if !inserted_ids.contains(&id) && !changes.deleted.contains(&id) {
            changes.deleted.push(id);
        }
    }
    Ok(changes)
}
