/*!
Error types for the data store.
*/

use crate::record::ObjectId;
use std::collections::BTreeMap;
use thiserror::Error;

/// Result type used throughout the data store.
pub type Result<T> = std::result::Result<T, DataStoreError>;

/// Errors that can occur while operating the context topology.
#[derive(Error, Debug)]
pub enum DataStoreError {
    /// The persistent store could not be opened or created at init time
    #[error("Could not attach persistent store: {0}")]
    StoreAttach(String),

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record failed schema validation during a context save
    #[error("Validation error: {0}")]
    Validation(String),

    /// No object with this identity is visible from the context
    #[error("No object with id {0}")]
    ObjectNotFound(ObjectId),

    /// A unique constraint was violated and the merge policy refused to resolve it
    #[error("Constraint conflict on {entity} for ({}): {value}", .attributes.join(", "))]
    ConstraintConflict {
        entity: String,
        attributes: Vec<String>,
        value: String,
    },

    /// Persistent store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The store was torn down between two stages of an asynchronous save
    #[error("A store captured by a save chain no longer exists, the remaining stages were skipped")]
    PrematureDeallocation,

    /// A per-stage save callback panicked; the chain stopped after that stage
    #[error("Save callback panicked after the {context} context saved: {message}")]
    SaveCallbackPanicked {
        context: &'static str,
        message: String,
    },

    /// Merging a sibling's saved changes failed; never surfaced to callers
    #[error("Change propagation failed: {0}")]
    MergePropagation(String),

    /// The entity is not declared in the schema
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// A class name resolved to zero or several entities
    #[error("Class {class_name} matched {} entities ({})", .matches.len(), .matches.join(", "))]
    InvalidEntityName {
        class_name: String,
        matches: Vec<String>,
    },

    /// Batch deletion failed for at least one entity
    #[error("Failed to delete objects for {} entities", .failures.len())]
    FailedEntityDeletion { failures: BTreeMap<String, String> },

    /// The operation is not available for the configured backend
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The worker thread behind a context queue is gone
    #[error("The {0} queue is no longer accepting work")]
    QueueUnavailable(&'static str),

    /// A blocking call was issued from the queue it would wait on
    #[error("Blocking call on the {0} queue issued from that same queue")]
    ReentrantWait(&'static str),
}

impl DataStoreError {
    /// Create a new store attach error
    pub fn store_attach<S: Into<String>>(msg: S) -> Self {
        Self::StoreAttach(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new unsupported operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// True for errors synthesized by the save chain itself rather than the engine
    pub fn is_coordination_error(&self) -> bool {
        matches!(
            self,
            Self::PrematureDeallocation
                | Self::SaveCallbackPanicked { .. }
                | Self::QueueUnavailable(_)
                | Self::ReentrantWait(_)
        )
    }
}
