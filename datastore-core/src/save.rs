/*!
Three-stage save coordination.

A full save runs `main`, then `background`, then `writer`, each stage on its
context's own queue. The writer stage is the single commit point to durable
storage. The chain stops at the first failing stage.

Once the writer stage has run, each saved context is reset on its own queue.
The reset only discards pending changes the chain itself saw; anything another
caller recorded after a stage saved stays buffered for that caller's save.

The asynchronous variant always delivers exactly one completion: a chain that
is abandoned midway (its topology dropped, or a stage torn down by a panic)
reports `PrematureDeallocation` instead of going silent.
*/

use crate::context::{ContextKind, ManagedContext};
use crate::observability;
use crate::queue::panic_message;
use crate::topology::ContextTopology;
use crate::{DataStoreError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

/// Invoked once per successfully saved context, on that context's queue
///
/// A panic inside the callback stops the chain with `SaveCallbackPanicked`.
pub type ContextSaveCallback = Arc<dyn Fn(&ManagedContext) + Send + Sync>;

type Completion = Box<dyn FnOnce(Result<()>) + Send>;

/// One step of a full save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStage {
    Main,
    Background,
    Writer,
}

impl SaveStage {
    pub const ORDER: [SaveStage; 3] = [SaveStage::Main, SaveStage::Background, SaveStage::Writer];

    pub fn context_kind(self) -> ContextKind {
        match self {
            Self::Main => ContextKind::Main,
            Self::Background => ContextKind::Background,
            Self::Writer => ContextKind::Writer,
        }
    }

    pub fn next(self) -> Option<SaveStage> {
        match self {
            Self::Main => Some(Self::Background),
            Self::Background => Some(Self::Writer),
            Self::Writer => None,
        }
    }
}

/// Drives full saves across a topology it does not own
#[derive(Debug, Clone)]
pub struct SaveCoordinator {
    topology: Weak<ContextTopology>,
}

impl SaveCoordinator {
    pub fn new(topology: &Arc<ContextTopology>) -> Self {
        Self {
            topology: Arc::downgrade(topology),
        }
    }

    /// Start an asynchronous full save
    ///
    /// Returns immediately. `completion` runs exactly once on the main queue,
    /// after the saved contexts have been reset when the writer stage was
    /// reached. If the topology is gone before the chain can continue,
    /// `completion` runs on the thread that noticed, with
    /// `PrematureDeallocation`.
    ///
    /// # Arguments
    /// * `on_context_save` - Called after each stage that saved successfully
    /// * `completion` - Receives the first error, or `Ok(())`
    pub fn save<F>(&self, on_context_save: Option<ContextSaveCallback>, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        debug!("Starting asynchronous save chain");
        let chain = SaveChain {
            topology: self.topology.clone(),
            on_context_save,
            completion: Some(Box::new(completion)),
            started: Instant::now(),
            saved: Vec::with_capacity(SaveStage::ORDER.len()),
        };
        chain.run_stage(SaveStage::Main);
    }

    /// Run a full save, blocking at each stage
    ///
    /// Must not be called from any context queue of this topology; the
    /// blocking hop onto that queue fails with `ReentrantWait`.
    pub fn save_and_wait(&self, on_context_save: Option<ContextSaveCallback>) -> Result<()> {
        let topology = self
            .topology
            .upgrade()
            .ok_or(DataStoreError::PrematureDeallocation)?;
        let started = Instant::now();

        let result = run_stages_and_wait(&topology, on_context_save)
            .and_then(|saved| reset_saved_and_wait(&topology, saved));
        if result.is_ok() {
            debug!("Save chain completed");
        }
        observability::record_save(started.elapsed(), result.is_ok());
        result
    }
}

/// Run `callback` for a saved context, reporting a panic as an error
fn notify_saved(callback: &ContextSaveCallback, context: &ManagedContext) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(|| callback(context))).map_err(|payload| {
        DataStoreError::SaveCallbackPanicked {
            context: context.kind().label(),
            message: panic_message(payload.as_ref()).to_string(),
        }
    })
}

fn run_stages_and_wait(
    topology: &ContextTopology,
    on_context_save: Option<ContextSaveCallback>,
) -> Result<Vec<(SaveStage, u64)>> {
    let mut saved = Vec::with_capacity(SaveStage::ORDER.len());
    for stage in SaveStage::ORDER {
        let callback = on_context_save.clone();
        let generation = topology
            .context(stage.context_kind())
            .perform_and_wait(move |context| -> Result<u64> {
                let (generation, result) = context.save_tracked();
                result?;
                if let Some(callback) = callback {
                    notify_saved(&callback, context)?;
                }
                Ok(generation)
            })?
            .map_err(|error| {
                warn!(?stage, %error, "Save stage failed, stopping the chain");
                error
            })?;
        saved.push((stage, generation));
        debug!(?stage, "Save stage completed");
    }
    Ok(saved)
}

/// Reset every saved context on its own queue, writer first
fn reset_saved_and_wait(topology: &ContextTopology, saved: Vec<(SaveStage, u64)>) -> Result<()> {
    for (stage, generation) in saved.into_iter().rev() {
        topology
            .context(stage.context_kind())
            .perform_and_wait(move |context| context.reset_saved(generation))?;
    }
    Ok(())
}

/// State carried from one stage of an asynchronous save to the next
struct SaveChain {
    topology: Weak<ContextTopology>,
    on_context_save: Option<ContextSaveCallback>,
    completion: Option<Completion>,
    started: Instant,
    /// Change generation each saved context started from, in stage order
    saved: Vec<(SaveStage, u64)>,
}

impl SaveChain {
    fn run_stage(self, stage: SaveStage) {
        let Some(topology) = self.topology.upgrade() else {
            warn!(?stage, "Store released before the save chain could continue");
            self.finish(Err(DataStoreError::PrematureDeallocation));
            return;
        };
        let context = topology.context(stage.context_kind()).clone();
        drop(topology);

        if let Err(error) = context.perform(move |context| self.save_stage(stage, context)) {
            warn!(?stage, %error, "Could not enqueue save stage");
        }
    }

    fn save_stage(mut self, stage: SaveStage, context: &ManagedContext) {
        let (generation, saved) = context.save_tracked();
        if saved.is_ok() || stage == SaveStage::Writer {
            self.saved.push((stage, generation));
        }
        let result = saved.and_then(|()| match &self.on_context_save {
            Some(callback) => notify_saved(callback, context),
            None => Ok(()),
        });

        match result {
            Ok(()) => {
                debug!(?stage, "Save stage completed");
                match stage.next() {
                    Some(next) => self.run_stage(next),
                    None => self.reset_and_deliver(Ok(())),
                }
            }
            Err(error) => {
                warn!(?stage, %error, "Save stage failed, stopping the chain");
                if stage == SaveStage::Writer {
                    self.reset_and_deliver(Err(error));
                } else {
                    self.deliver(Err(error));
                }
            }
        }
    }

    /// Reset the saved contexts one queue at a time, writer first, then deliver
    fn reset_and_deliver(mut self, result: Result<()>) {
        let Some((stage, generation)) = self.saved.pop() else {
            self.deliver(result);
            return;
        };
        let Some(topology) = self.topology.upgrade() else {
            self.finish(Err(DataStoreError::PrematureDeallocation));
            return;
        };
        let context = topology.context(stage.context_kind()).clone();
        drop(topology);

        let enqueued = context.perform(move |context| {
            context.reset_saved(generation);
            self.reset_and_deliver(result);
        });
        if let Err(error) = enqueued {
            warn!(?stage, %error, "Could not enqueue context reset");
        }
    }

    /// Hand `result` to the main queue
    fn deliver(self, result: Result<()>) {
        let Some(topology) = self.topology.upgrade() else {
            self.finish(Err(DataStoreError::PrematureDeallocation));
            return;
        };
        let main = topology.main().clone();
        drop(topology);

        if let Err(error) = main.perform(move |_| self.finish(result)) {
            warn!(%error, "Could not enqueue save completion");
        }
    }

    fn finish(mut self, result: Result<()>) {
        if let Some(completion) = self.completion.take() {
            observability::record_save(self.started.elapsed(), result.is_ok());
            completion(result);
        }
    }
}

impl Drop for SaveChain {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            warn!("Save chain abandoned before completion");
            observability::record_save(self.started.elapsed(), false);
            completion(Err(DataStoreError::PrematureDeallocation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreOptions;
    use crate::record::Record;
    use crate::schema::{AttributeKind, EntityDescription, Schema};
    use crate::storage::{MemoryStore, MockStoreAdapter, StoreAdapter};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn schema() -> Schema {
        Schema::new(vec![EntityDescription::new("Person")
            .required("firstName", AttributeKind::String)
            .attribute("lastName", AttributeKind::String)])
    }

    fn topology_with(store: Box<dyn StoreAdapter>) -> Arc<ContextTopology> {
        Arc::new(ContextTopology::with_store(schema(), store, StoreOptions::default()).unwrap())
    }

    fn failing_store() -> Box<dyn StoreAdapter> {
        let mut store = MockStoreAdapter::new();
        store.expect_location().returning(|| None);
        store.expect_load_records().returning(|_| Ok(Vec::new()));
        store.expect_load_record().returning(|_| Ok(None));
        store
            .expect_commit()
            .returning(|_| Err(DataStoreError::storage("disk full")));
        Box::new(store)
    }

    fn recorder() -> (ContextSaveCallback, Arc<Mutex<Vec<ContextKind>>>) {
        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stages);
        let callback: ContextSaveCallback = Arc::new(move |context: &ManagedContext| {
            sink.lock().push(context.kind());
        });
        (callback, stages)
    }

    fn insert(context: &ManagedContext, first: &str) -> Record {
        context
            .insert_object("Person", |p| p.set("firstName", first))
            .unwrap()
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(SaveStage::Main.next(), Some(SaveStage::Background));
        assert_eq!(SaveStage::Background.next(), Some(SaveStage::Writer));
        assert_eq!(SaveStage::Writer.next(), None);
        assert_eq!(SaveStage::ORDER[0].context_kind(), ContextKind::Main);
    }

    #[test]
    fn test_save_and_wait_runs_stages_in_order() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");
        insert(topology.background(), "Nils");

        let (callback, stages) = recorder();
        coordinator.save_and_wait(Some(callback)).unwrap();

        assert_eq!(
            *stages.lock(),
            vec![ContextKind::Main, ContextKind::Background, ContextKind::Writer]
        );
        assert!(!topology.has_changes());
        assert_eq!(topology.writer().find_all("Person").unwrap().len(), 2);
    }

    #[test]
    fn test_save_and_wait_stops_at_failing_stage() {
        let mut store = MockStoreAdapter::new();
        store.expect_location().returning(|| None);
        store.expect_load_records().returning(|_| Ok(Vec::new()));
        store.expect_commit().never();
        let topology = topology_with(Box::new(store));
        let coordinator = SaveCoordinator::new(&topology);

        insert(topology.main(), "Jad");
        topology
            .background()
            .insert_object("Person", |p| p.set("lastName", "Osseiran"))
            .unwrap();

        let (callback, stages) = recorder();
        let result = coordinator.save_and_wait(Some(callback));

        assert!(matches!(result, Err(DataStoreError::Validation(_))));
        assert_eq!(*stages.lock(), vec![ContextKind::Main]);
        // Nothing was reset: the writer still holds what main pushed
        assert!(topology.writer().has_changes());
        assert!(topology.background().has_changes());
    }

    #[test]
    fn test_save_and_wait_surfaces_writer_error() {
        let topology = topology_with(failing_store());
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");

        let result = coordinator.save_and_wait(None);
        assert!(matches!(result, Err(DataStoreError::Storage(message)) if message == "disk full"));
    }

    #[test]
    fn test_async_save_completes_once_on_main_queue() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");

        let (callback, stages) = recorder();
        let (tx, rx) = mpsc::channel();
        let main = topology.main().clone();
        coordinator.save(Some(callback), move |result| {
            tx.send((result.is_ok(), main.is_on_queue())).unwrap();
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, true));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(
            *stages.lock(),
            vec![ContextKind::Main, ContextKind::Background, ContextKind::Writer]
        );
        assert!(!topology.has_changes());
    }

    #[test]
    fn test_async_writer_failure_resets_contexts() {
        let topology = topology_with(failing_store());
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");

        let (tx, rx) = mpsc::channel();
        coordinator.save(None, move |result| tx.send(result).unwrap());

        let result = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(result, Err(DataStoreError::Storage(_))));
        assert!(!topology.has_changes());
    }

    #[test]
    fn test_async_early_failure_keeps_changes() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        topology
            .main()
            .insert_object("Person", |p| p.set("lastName", "Osseiran"))
            .unwrap();

        let (callback, stages) = recorder();
        let (tx, rx) = mpsc::channel();
        coordinator.save(Some(callback), move |result| tx.send(result).unwrap());

        let result = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(result, Err(DataStoreError::Validation(_))));
        assert!(stages.lock().is_empty());
        assert!(topology.main().has_changes());
    }

    #[test]
    fn test_premature_deallocation_is_reported() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");

        // Hold the main queue so the chain can not start yet
        let (release_tx, release_rx) = mpsc::channel::<()>();
        topology
            .main()
            .perform(move |_| {
                let _ = release_rx.recv();
            })
            .unwrap();

        let (tx, rx) = mpsc::channel();
        coordinator.save(None, move |result| tx.send(result).unwrap());
        drop(topology);
        release_tx.send(()).unwrap();

        let result = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(result, Err(DataStoreError::PrematureDeallocation)));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_save_and_wait_after_release() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        drop(topology);

        let result = coordinator.save_and_wait(None);
        assert!(matches!(result, Err(DataStoreError::PrematureDeallocation)));
    }

    #[test]
    fn test_panicking_callback_stops_chain_on_main_queue() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");

        let callback: ContextSaveCallback = Arc::new(|_: &ManagedContext| panic!("callback"));
        let (tx, rx) = mpsc::channel();
        let main = topology.main().clone();
        coordinator.save(Some(callback), move |result| {
            tx.send((result, main.is_on_queue())).unwrap();
        });

        let (result, on_main) = rx.recv_timeout(WAIT).unwrap();
        assert!(on_main);
        assert!(matches!(
            result,
            Err(DataStoreError::SaveCallbackPanicked { context: "main", ref message }) if message == "callback"
        ));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        // Main had saved into the writer before the callback ran
        assert!(topology.writer().has_changes());
    }

    #[test]
    fn test_panicking_callback_fails_blocking_save() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");

        let callback: ContextSaveCallback = Arc::new(|context: &ManagedContext| {
            if context.kind() == ContextKind::Background {
                panic!("background callback");
            }
        });
        let result = coordinator.save_and_wait(Some(callback));
        assert!(matches!(
            result,
            Err(DataStoreError::SaveCallbackPanicked { context: "background", .. })
        ));
        assert!(topology.writer().has_changes());
    }

    /// Records new work on main and pushes more through background into the
    /// writer, right after the writer stage has saved
    fn late_work(topology: &ContextTopology) -> ContextSaveCallback {
        let main = topology.main().clone();
        let background = topology.background().clone();
        Arc::new(move |context: &ManagedContext| {
            if context.kind() == ContextKind::Writer {
                insert(&main, "Nils");
                insert(&background, "Osseiran");
                background.save().unwrap();
            }
        })
    }

    #[test]
    fn test_async_reset_keeps_work_recorded_after_the_stage() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.main(), "Jad");

        let (tx, rx) = mpsc::channel();
        coordinator.save(Some(late_work(&topology)), move |result| tx.send(result).unwrap());
        rx.recv_timeout(WAIT).unwrap().unwrap();

        assert!(topology.main().has_changes());
        assert!(topology.writer().has_changes());
        assert!(!topology.background().has_changes());

        coordinator.save_and_wait(None).unwrap();
        assert!(!topology.has_changes());
        assert_eq!(topology.writer().find_all("Person").unwrap().len(), 3);
    }

    #[test]
    fn test_blocking_reset_keeps_work_recorded_after_the_stage() {
        let topology = topology_with(Box::new(MemoryStore::new()));
        let coordinator = SaveCoordinator::new(&topology);
        insert(topology.background(), "Jad");

        coordinator.save_and_wait(Some(late_work(&topology))).unwrap();
        assert!(topology.main().has_changes());
        assert!(topology.writer().has_changes());

        coordinator.save_and_wait(None).unwrap();
        assert!(!topology.has_changes());
        assert_eq!(topology.writer().find_all("Person").unwrap().len(), 3);
    }
}
