/*!
Integration tests spanning main, background and writer together.
*/

use datastore_core::{
    AttributeKind, ContextKind, ContextSaveCallback, DataStore, DataStoreError, EntityDescription,
    FetchRequest, ManagedContext, Schema, StoreConfig,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn people() -> Schema {
    Schema::new(vec![EntityDescription::new("Person")
        .required("firstName", AttributeKind::String)
        .attribute("lastName", AttributeKind::String)])
}

fn first_names(ctx: &ManagedContext) -> datastore_core::Result<Vec<String>> {
    let mut names: Vec<String> = ctx
        .find_all("Person")?
        .iter()
        .filter_map(|p| p.get_str("firstName").map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

fn recording_callback() -> (ContextSaveCallback, Arc<Mutex<Vec<ContextKind>>>) {
    let stages = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&stages);
    let callback: ContextSaveCallback = Arc::new(move |ctx: &ManagedContext| {
        recorded.lock().push(ctx.kind());
    });
    (callback, stages)
}

#[test]
fn test_siblings_are_independent_before_save() {
    let store = DataStore::in_memory(people()).unwrap();

    let main = store.perform_on_main_and_wait(|ctx| {
        ctx.insert_object("Person", |p| p.set("firstName", "Jad"))
    });
    let background = store.perform_on_background_and_wait(|ctx| {
        ctx.insert_object("Person", |p| p.set("firstName", "Nils"))
    });
    main.unwrap().unwrap();
    background.unwrap().unwrap();

    assert!(store.main_context().has_changes());
    assert!(store.background_context().has_changes());

    let seen_on_main = store.perform_on_main_and_wait(first_names).unwrap().unwrap();
    let seen_on_background = store
        .perform_on_background_and_wait(first_names)
        .unwrap()
        .unwrap();
    assert_eq!(seen_on_main, vec!["Jad".to_string()]);
    assert_eq!(seen_on_background, vec!["Nils".to_string()]);

    store.save_and_wait(None).unwrap();
    let seen_after_save = store.perform_on_main_and_wait(first_names).unwrap().unwrap();
    assert_eq!(seen_after_save, vec!["Jad".to_string(), "Nils".to_string()]);
}

#[test]
fn test_stages_run_main_background_writer() {
    let store = DataStore::in_memory(people()).unwrap();
    let (callback, stages) = recording_callback();

    store.save_and_wait(Some(callback)).unwrap();
    assert_eq!(
        *stages.lock(),
        vec![ContextKind::Main, ContextKind::Background, ContextKind::Writer]
    );
}

#[test]
fn test_async_save_reports_stages_in_order() {
    let store = DataStore::in_memory(people()).unwrap();
    let (callback, stages) = recording_callback();
    let (tx, rx) = mpsc::channel();

    store.save(Some(callback), move |result| tx.send(result).unwrap());

    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(
        *stages.lock(),
        vec![ContextKind::Main, ContextKind::Background, ContextKind::Writer]
    );
}

#[test]
fn test_successful_save_resets_every_context() {
    let store = DataStore::in_memory(people()).unwrap();

    store
        .perform_on_main_and_wait(|ctx| ctx.insert_object("Person", |p| p.set("firstName", "Jad")))
        .unwrap()
        .unwrap();
    store
        .perform_on_background_and_wait(|ctx| {
            ctx.insert_object("Person", |p| p.set("firstName", "Nils"))
        })
        .unwrap()
        .unwrap();
    assert!(store.has_changes());

    store.save_and_wait(None).unwrap();
    assert!(!store.has_changes());

    let (tx, rx) = mpsc::channel();
    store
        .perform_on_background_and_save(
            |ctx| {
                ctx.insert_object("Person", |p| p.set("firstName", "Osseiran"))
                    .unwrap();
            },
            move |_, result| tx.send(result).unwrap(),
        )
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(!store.has_changes());
}

#[test]
fn test_background_failure_halts_the_chain() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.json");
    let store = DataStore::open(people(), StoreConfig::json_file(&path)).unwrap();
    let (callback, stages) = recording_callback();

    store
        .perform_on_main_and_wait(|ctx| ctx.insert_object("Person", |p| p.set("firstName", "Jad")))
        .unwrap()
        .unwrap();
    store
        .perform_on_background_and_wait(|ctx| {
            ctx.insert_object("Person", |p| p.set("lastName", "Osseiran"))
        })
        .unwrap()
        .unwrap();

    let result = store.save_and_wait(Some(callback));
    assert!(matches!(result, Err(DataStoreError::Validation(_))));
    assert_eq!(*stages.lock(), vec![ContextKind::Main]);

    // Nothing reached the store file
    let reopened = DataStore::open(people(), StoreConfig::json_file(&path)).unwrap();
    let stored = reopened
        .perform_on_main_and_wait(|ctx| ctx.count(&FetchRequest::new("Person")))
        .unwrap()
        .unwrap();
    assert_eq!(stored, 0);

    // Main's changes wait in the writer, background keeps its invalid insert
    assert!(store.background_context().has_changes());
    assert!(store.has_changes());
}

/// Four threads alternate main and background `and_save` calls; returns the
/// outcomes in arrival order and the number of people stored afterwards
fn run_concurrent_saves(calls: usize) -> (Vec<bool>, usize) {
    let store = Arc::new(DataStore::in_memory(people()).unwrap());
    let completions = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            let completions = Arc::clone(&completions);
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..calls / 4 {
                    let name = format!("worker {worker} item {i}");
                    let completions = Arc::clone(&completions);
                    let tx = tx.clone();
                    let work = move |ctx: &ManagedContext| {
                        ctx.insert_object("Person", |p| p.set("firstName", name))
                            .unwrap();
                    };
                    let completion = move |_: &ManagedContext, result: datastore_core::Result<()>| {
                        completions.fetch_add(1, Ordering::SeqCst);
                        tx.send(result.is_ok()).unwrap();
                    };
                    if i % 2 == 0 {
                        store.perform_on_main_and_save(work, completion).unwrap();
                    } else {
                        store.perform_on_background_and_save(work, completion).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    drop(tx);

    let outcomes: Vec<bool> = (0..calls)
        .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
        .collect();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(completions.load(Ordering::SeqCst), calls);

    let stored = store
        .perform_on_background_and_wait(|ctx| ctx.count(&FetchRequest::new("Person")))
        .unwrap()
        .unwrap();
    (outcomes, stored)
}

#[test]
fn test_concurrent_saves_complete_exactly_once() {
    let calls = 40;
    for _ in 0..20 {
        let (outcomes, stored) = run_concurrent_saves(calls);
        assert_eq!(outcomes.len(), calls);

        // Every insert reported as saved has reached the store
        let saved = outcomes.iter().filter(|ok| **ok).count();
        assert_eq!(saved, calls);
        assert_eq!(stored, saved);
    }
}

#[test]
fn test_reset_contexts_discards_everything() {
    let store = DataStore::in_memory(people()).unwrap();
    store
        .perform_on_main_and_wait(|ctx| ctx.insert_object("Person", |p| p.set("firstName", "Jad")))
        .unwrap()
        .unwrap();

    store.reset_contexts();
    store.reset_contexts();
    assert!(!store.has_changes());

    store.save_and_wait(None).unwrap();
    let count = store
        .perform_on_background_and_wait(|ctx| ctx.count(&FetchRequest::new("Person")))
        .unwrap()
        .unwrap();
    assert_eq!(count, 0);
}
