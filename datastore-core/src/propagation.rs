/*!
Sibling change propagation.

When the main or background context saves, the changes it pushed into the
writer are merged into the other sibling on that sibling's own queue. Merges
are best effort: a failure is logged and dropped, never reported to the code
that saved.
*/

use crate::context::{ChangeNotification, ContextId, ContextKind, ManagedContext, WeakContext};
use crate::events::{EventHub, StoreEvent};
use crate::observability;
use crate::{DataStoreError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keeps `main` and `background` consistent with each other's saves
pub struct ChangePropagationBridge {
    main: WeakContext,
    main_id: ContextId,
    background: WeakContext,
    background_id: ContextId,
    events: Arc<EventHub>,
}

impl ChangePropagationBridge {
    /// Wire save observers on both siblings
    pub fn install(
        main: &ManagedContext,
        background: &ManagedContext,
        events: Arc<EventHub>,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            main: main.downgrade(),
            main_id: main.id(),
            background: background.downgrade(),
            background_id: background.id(),
            events,
        });

        for context in [main, background] {
            let observer = Arc::clone(&bridge);
            context.set_save_observer(Some(Arc::new(move |notification: &ChangeNotification| {
                observer.context_did_save(notification)
            })));
        }
        bridge
    }

    /// Remove the observers installed by `install`
    pub fn uninstall(&self) {
        for context in [&self.main, &self.background] {
            if let Some(context) = context.upgrade() {
                context.set_save_observer(None);
            }
        }
    }

    /// React to a save of one of the siblings
    ///
    /// Only notifications whose origin is the exact main or background
    /// context this bridge was installed on are acted upon.
    pub fn context_did_save(&self, notification: &ChangeNotification) {
        let (target, merged) = if notification.origin == self.main_id {
            (&self.background, ContextKind::Background)
        } else if notification.origin == self.background_id {
            (&self.main, ContextKind::Main)
        } else {
            debug!(
                origin = %notification.origin,
                kind = %notification.kind,
                "Ignoring save notification from a foreign context"
            );
            return;
        };

        if let Err(error) = self.propagate(target, merged, notification.clone()) {
            warn!(%error, "Dropping change propagation");
        }
    }

    fn propagate(
        &self,
        target: &WeakContext,
        merged: ContextKind,
        notification: ChangeNotification,
    ) -> Result<()> {
        let context = target.upgrade().ok_or_else(|| {
            DataStoreError::MergePropagation(format!("the {merged} context no longer exists"))
        })?;

        let saved = notification.kind;
        let events = Arc::clone(&self.events);
        context
            .perform(move |context| {
                context.merge_changes(&notification);
                observability::record_merge();
                events.publish(StoreEvent::ContextSavedAndMerged { saved, merged });
            })
            .map_err(|e| DataStoreError::MergePropagation(e.to_string()))
    }
}
