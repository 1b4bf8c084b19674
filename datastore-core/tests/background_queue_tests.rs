/*!
Integration tests for work performed on the background context.
*/

use datastore_core::{
    AttributeKind, ContextKind, DataStore, DataStoreError, EntityDescription, FetchRequest,
    Predicate, Schema, StoreEvent,
};
use std::sync::mpsc;
use std::time::Duration;

fn people() -> Schema {
    Schema::new(vec![EntityDescription::new("Person")
        .required("firstName", AttributeKind::String)
        .attribute("lastName", AttributeKind::String)
        .attribute("age", AttributeKind::Integer)])
}

#[test]
fn test_background_import_reaches_main() {
    let store = DataStore::in_memory(people()).unwrap();

    store
        .perform_on_background_wait_and_save(|ctx| -> datastore_core::Result<()> {
            for age in 20..70 {
                ctx.insert_object("Person", |p| {
                    p.set("firstName", format!("Person {age}"));
                    p.set("age", age);
                })?;
            }
            Ok(())
        })
        .unwrap()
        .unwrap();

    let count = store
        .perform_on_main_and_wait(|ctx| ctx.count(&FetchRequest::new("Person")))
        .unwrap()
        .unwrap();
    assert_eq!(count, 50);
    assert!(!store.has_changes());
}

#[test]
fn test_background_save_refreshes_objects_on_main() {
    let store = DataStore::in_memory(people()).unwrap();
    let events = store.subscribe();

    let person = store
        .perform_on_main_wait_and_save(|ctx| {
            ctx.insert_object("Person", |p| p.set("firstName", "Nils"))
        })
        .unwrap()
        .unwrap();

    // Materialize the object on main before the background edit
    let id = person.id;
    store
        .perform_on_main_and_wait(move |ctx| ctx.object(id))
        .unwrap()
        .unwrap()
        .unwrap();

    store
        .perform_on_background_and_wait(move |ctx| -> datastore_core::Result<()> {
            ctx.update_object(id, |p| p.set("lastName", "Osseiran"))?;
            ctx.save()
        })
        .unwrap()
        .unwrap();

    // The earlier main save also announces its merge into background
    let expected = StoreEvent::ContextSavedAndMerged {
        saved: ContextKind::Background,
        merged: ContextKind::Main,
    };
    loop {
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        if event == expected {
            break;
        }
    }

    let refreshed = store
        .perform_on_main_and_wait(move |ctx| ctx.object(id))
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.get_str("lastName"), Some("Osseiran"));
}

#[test]
fn test_background_and_save_reports_failure_once() {
    let store = DataStore::in_memory(people()).unwrap();
    let (tx, rx) = mpsc::channel();

    store
        .perform_on_background_and_save(
            |ctx| {
                ctx.insert_object("Person", |p| p.set("age", 31)).unwrap();
            },
            move |ctx, result| {
                tx.send((ctx.kind(), result)).unwrap();
            },
        )
        .unwrap();

    let (kind, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, ContextKind::Background);
    assert!(matches!(result, Err(DataStoreError::Validation(_))));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_find_or_insert_reuses_existing_object() {
    let store = DataStore::in_memory(people()).unwrap();

    let (first, second) = store
        .perform_on_background_and_wait(|ctx| -> datastore_core::Result<_> {
            let first = ctx.find_or_insert("Person", Predicate::equals("firstName", "Jad"), |p| {
                p.set("firstName", "Jad")
            })?;
            let second = ctx.find_or_insert("Person", Predicate::equals("firstName", "Jad"), |p| {
                p.set("firstName", "Jad")
            })?;
            Ok((first, second))
        })
        .unwrap()
        .unwrap();

    assert_eq!(first.id, second.id);
}

#[test]
fn test_delete_on_background_is_durable() {
    let store = DataStore::in_memory(people()).unwrap();

    let person = store
        .perform_on_main_wait_and_save(|ctx| {
            ctx.insert_object("Person", |p| p.set("firstName", "Jad"))
        })
        .unwrap()
        .unwrap();

    let id = person.id;
    store
        .perform_on_background_wait_and_save(move |ctx| ctx.delete_object(id))
        .unwrap()
        .unwrap();

    let found = store
        .perform_on_main_and_wait(move |ctx| ctx.object(id))
        .unwrap()
        .unwrap();
    assert!(found.is_none());
}
