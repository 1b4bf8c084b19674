/*!
Typed store events and their subscribers.
*/

use crate::context::ContextKind;
use crate::filesystem::StoreDirectory;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::mpsc;

/// Something observable happened to the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// `saved` finished a save and its changes were merged into `merged`
    ContextSavedAndMerged {
        saved: ContextKind,
        merged: ContextKind,
    },
    /// Pending changes were flushed before the persistent store was swapped
    ChangesSavedBeforeStoreSwap { error: Option<String> },
    /// The store file now lives at `location`
    StoreMoved {
        location: PathBuf,
        directory: StoreDirectory,
    },
    /// The persistent store was replaced with an empty one
    StoreReset,
}

/// Fan-out of store events to every live subscriber
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::Sender<StoreEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; events published from now on are delivered to it
    pub fn subscribe(&self) -> mpsc::Receiver<StoreEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Deliver `event` to every subscriber, forgetting those that hung up
    pub fn publish(&self, event: StoreEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        tracing::trace!(?event, subscribers = subscribers.len(), "Published store event");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
