//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by store writes and batch control.
///
/// All of these signal a programming mistake at the call site; none of them
/// leave the store in a partially updated state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A plain value was assigned to a computed key that has no setter.
    #[error("cannot assign to computed property `{path}`: it has no setter")]
    ComputedWithoutSetter { path: String },

    /// A batch-control name was used as a data key on the root object.
    #[error("`{key}` is reserved for batch control")]
    ReservedKey { key: String },

    /// An array operation was invoked on an object node.
    #[error("`{op}` requires an array, but `{path}` is an object")]
    NotAnArray { op: &'static str, path: String },

    /// A non-index key was used on an array node.
    #[error("`{key}` is not a valid index for the array at `{path}`")]
    InvalidKey { key: String, path: String },

    /// `commit_batch` was called without a matching `begin_batch`.
    #[error("no batch is active")]
    NoActiveBatch,
}

/// Errors produced when converting snapshots to tree-shaped formats.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The snapshot contains a cycle, which a tree-shaped format cannot hold.
    #[error("cyclic reference at `{path}` cannot be represented as a tree")]
    Cycle { path: String },

    /// A store can only be created from an object.
    #[error("store state must be an object, found {found}")]
    NotAnObject { found: &'static str },
}

impl StoreError {
    pub(crate) fn computed_without_setter(path: impl Into<String>) -> Self {
        Self::ComputedWithoutSetter { path: path.into() }
    }

    pub(crate) fn invalid_key(key: impl ToString, path: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            path: path.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
