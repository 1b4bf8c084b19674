/*!
Integration tests for work performed on the main context.
*/

use datastore_core::{
    AttributeKind, ContextKind, DataStore, DataStoreError, EntityDescription, FetchRequest,
    Predicate, Schema, SortDescriptor,
};
use std::sync::mpsc;
use std::time::Duration;

fn people() -> Schema {
    Schema::new(vec![EntityDescription::new("Person")
        .required("firstName", AttributeKind::String)
        .attribute("lastName", AttributeKind::String)])
}

#[test]
fn test_insert_on_main_is_visible_on_background_after_save() {
    let store = DataStore::in_memory(people()).unwrap();

    store
        .perform_on_main_and_wait(|ctx| {
            ctx.insert_object("Person", |p| {
                p.set("firstName", "Jad");
                p.set("lastName", "Osseiran");
            })
        })
        .unwrap()
        .unwrap();
    store.save_and_wait(None).unwrap();

    let matches = store
        .perform_on_background_and_wait(|ctx| {
            ctx.fetch(
                &FetchRequest::new("Person").with_predicate(Predicate::equals("lastName", "Osseiran")),
            )
        })
        .unwrap()
        .unwrap();

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get_str("firstName"), Some("Jad"));
    assert_eq!(matches[0].get_str("lastName"), Some("Osseiran"));
}

#[test]
fn test_descending_sort_reverses_insertion_order() {
    let store = DataStore::in_memory(people()).unwrap();

    store
        .perform_on_main_wait_and_save(|ctx| -> datastore_core::Result<()> {
            for digit in 0..10 {
                ctx.insert_object("Person", |p| p.set("firstName", digit.to_string()))?;
            }
            Ok(())
        })
        .unwrap()
        .unwrap();

    let names: String = store
        .perform_on_main_and_wait(|ctx| {
            ctx.fetch(&FetchRequest::new("Person").sorted_by(SortDescriptor::descending("firstName")))
        })
        .unwrap()
        .unwrap()
        .iter()
        .filter_map(|p| p.get_str("firstName").map(str::to_string))
        .collect();

    assert_eq!(names, "9876543210");
}

#[test]
fn test_perform_on_main_runs_in_submission_order() {
    let store = DataStore::in_memory(people()).unwrap();
    let (tx, rx) = mpsc::channel();

    for i in 0..20 {
        let tx = tx.clone();
        store
            .perform_on_main(move |ctx| {
                assert_eq!(ctx.kind(), ContextKind::Main);
                tx.send(i).unwrap();
            })
            .unwrap();
    }
    drop(tx);

    let order: Vec<i32> = rx.iter().collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
}

#[test]
fn test_perform_on_main_and_save_completes_on_main() {
    let store = DataStore::in_memory(people()).unwrap();
    let (tx, rx) = mpsc::channel();

    store
        .perform_on_main_and_save(
            |ctx| {
                ctx.insert_object("Person", |p| p.set("firstName", "Jad"))
                    .unwrap();
            },
            move |ctx, result| {
                tx.send((ctx.kind(), ctx.is_on_queue(), result.is_ok()))
                    .unwrap();
            },
        )
        .unwrap();

    let (kind, on_queue, ok) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, ContextKind::Main);
    assert!(on_queue);
    assert!(ok);
    assert!(!store.has_changes());

    let count = store
        .perform_on_background_and_wait(|ctx| ctx.count(&FetchRequest::new("Person")))
        .unwrap()
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_main_wait_and_save_surfaces_validation_error() {
    let store = DataStore::in_memory(people()).unwrap();

    let result = store.perform_on_main_wait_and_save(|ctx| {
        ctx.insert_object("Person", |p| p.set("lastName", "Osseiran"))
            .map(|_| ())
    });

    assert!(matches!(result, Err(DataStoreError::Validation(_))));
    // The failed stage keeps its changes
    assert!(store.main_context().has_changes());
}

#[test]
fn test_unknown_entity_is_rejected_on_insert() {
    let store = DataStore::in_memory(people()).unwrap();

    let result = store
        .perform_on_main_and_wait(|ctx| ctx.insert_object("Spaceship", |_| {}))
        .unwrap();
    assert!(matches!(result, Err(DataStoreError::UnknownEntity(_))));
    assert!(!store.has_changes());
}
