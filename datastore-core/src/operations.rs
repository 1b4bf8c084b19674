/*!
Perform primitives: run caller work on the main or background context.

| Method suffix      | Queue behaviour               | Save behaviour                         |
|--------------------|-------------------------------|----------------------------------------|
| (none)             | enqueue and return            | none                                   |
| `_and_save`        | enqueue and return            | asynchronous full save, then completion |
| `_and_wait`        | block until the work has run  | none                                   |
| `_wait_and_save`   | block until the work has run  | blocking full save                     |

The blocking variants must not be called from the queue they target.
*/

use crate::context::{ContextKind, ManagedContext};
use crate::store::DataStore;
use crate::Result;

impl DataStore {
    /// Enqueue `work` on the main context
    pub fn perform_on_main<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&ManagedContext) + Send + 'static,
    {
        self.perform_on(ContextKind::Main, work)
    }

    /// Enqueue `work` on the main context, then run a full save
    ///
    /// When this returns `Ok`, `completion` is called exactly once with the
    /// main context and the outcome of the save.
    pub fn perform_on_main_and_save<F, C>(&self, work: F, completion: C) -> Result<()>
    where
        F: FnOnce(&ManagedContext) + Send + 'static,
        C: FnOnce(&ManagedContext, Result<()>) + Send + 'static,
    {
        self.perform_on_and_save(ContextKind::Main, work, completion)
    }

    /// Run `work` on the main context and return its output
    pub fn perform_on_main_and_wait<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&ManagedContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.topology.main().perform_and_wait(work)
    }

    /// Run `work` on the main context, then a blocking full save
    pub fn perform_on_main_wait_and_save<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&ManagedContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.perform_on_wait_and_save(ContextKind::Main, work)
    }

    /// Enqueue `work` on the background context
    pub fn perform_on_background<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&ManagedContext) + Send + 'static,
    {
        self.perform_on(ContextKind::Background, work)
    }

    /// Enqueue `work` on the background context, then run a full save
    pub fn perform_on_background_and_save<F, C>(&self, work: F, completion: C) -> Result<()>
    where
        F: FnOnce(&ManagedContext) + Send + 'static,
        C: FnOnce(&ManagedContext, Result<()>) + Send + 'static,
    {
        self.perform_on_and_save(ContextKind::Background, work, completion)
    }

    pub fn perform_on_background_and_wait<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&ManagedContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.topology.background().perform_and_wait(work)
    }

    pub fn perform_on_background_wait_and_save<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&ManagedContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.perform_on_wait_and_save(ContextKind::Background, work)
    }

    fn perform_on<F>(&self, kind: ContextKind, work: F) -> Result<()>
    where
        F: FnOnce(&ManagedContext) + Send + 'static,
    {
        self.topology.context(kind).perform(work)
    }

    fn perform_on_and_save<F, C>(&self, kind: ContextKind, work: F, completion: C) -> Result<()>
    where
        F: FnOnce(&ManagedContext) + Send + 'static,
        C: FnOnce(&ManagedContext, Result<()>) + Send + 'static,
    {
        let coordinator = self.coordinator.clone();
        self.topology.context(kind).perform(move |context| {
            work(context);
            let context = context.clone();
            coordinator.save(None, move |result| completion(&context, result));
        })
    }

    fn perform_on_wait_and_save<F, R>(&self, kind: ContextKind, work: F) -> Result<R>
    where
        F: FnOnce(&ManagedContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let value = self.topology.context(kind).perform_and_wait(work)?;
        self.coordinator.save_and_wait(None)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::{AttributeKind, EntityDescription, Schema};
    use crate::{ContextKind, DataStore, DataStoreError};
    use std::sync::mpsc;
    use std::time::Duration;

    fn store() -> DataStore {
        DataStore::in_memory(Schema::new(vec![EntityDescription::new("Person")
            .required("firstName", AttributeKind::String)]))
        .unwrap()
    }

    #[test]
    fn test_perform_runs_on_target_queue() {
        let store = store();
        let (tx, rx) = mpsc::channel();

        let main_tx = tx.clone();
        store
            .perform_on_main(move |ctx| {
                main_tx.send((ctx.kind(), ctx.is_on_queue())).unwrap();
            })
            .unwrap();
        store
            .perform_on_background(move |ctx| {
                tx.send((ctx.kind(), ctx.is_on_queue())).unwrap();
            })
            .unwrap();

        let mut seen = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        seen.sort_by_key(|(kind, _)| kind.label());
        assert_eq!(
            seen,
            vec![(ContextKind::Background, true), (ContextKind::Main, true)]
        );
    }

    #[test]
    fn test_perform_and_save_hands_back_the_context() {
        let store = store();
        let (tx, rx) = mpsc::channel();

        store
            .perform_on_background_and_save(
                |ctx| {
                    ctx.insert_object("Person", |p| p.set("firstName", "Nils"))
                        .unwrap();
                },
                move |ctx, result| {
                    tx.send((ctx.kind(), result.is_ok())).unwrap();
                },
            )
            .unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, (ContextKind::Background, true));
        assert!(!store.has_changes());
    }

    #[test]
    fn test_wait_and_save_rethrows_save_error() {
        let store = store();
        let result = store.perform_on_main_wait_and_save(|ctx| {
            ctx.insert_object("Person", |p| p.set("firstName", 42))
                .map(|_| ())
        });

        assert!(matches!(result, Err(DataStoreError::Validation(_))));
        assert!(store.has_changes());
    }

    #[test]
    fn test_nested_wait_on_same_queue_is_rejected() {
        let store = std::sync::Arc::new(store());
        let inner = std::sync::Arc::clone(&store);

        let nested = store
            .perform_on_main_and_wait(move |_| inner.perform_on_main_and_wait(|_| ()))
            .unwrap();
        assert!(matches!(nested, Err(DataStoreError::ReentrantWait("main"))));
    }
}
