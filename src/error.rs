//! Canonical capability errors (identity parsing, change capture, patch
//! application).
//!
//! These are bounded and stable: they represent domain/refusal states, not
//! library implementation details. Every error leaves the input document
//! unmodified; nothing is swallowed or retried at this layer.

use thiserror::Error;

use crate::identity::ObjectId;

/// Invalid identifier string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("actor id `{raw}` is invalid: {reason}")]
    Actor { raw: String, reason: String },
    #[error("object id `{raw}` is invalid: {reason}")]
    Object { raw: String, reason: String },
    #[error("element id `{raw}` is invalid: {reason}")]
    Elem { raw: String, reason: String },
}

/// Error raised while capturing mutations inside a change block.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ChangeError {
    /// A write was attempted before the document's actor id was set.
    #[error("actor id is unset; call set_actor_id before mutating")]
    ActorIdUnset,

    /// Counter fields only move via increment/decrement.
    #[error("cannot assign over counter field {key:?} of object {obj}")]
    CannotOverwriteCounter { obj: ObjectId, key: String },

    /// The value has no CRDT representation.
    #[error("unsupported value: {reason}")]
    UnsupportedValue { reason: String },

    /// Increment targeted a field that does not hold a counter.
    #[error("field {key:?} of object {obj} is not a counter")]
    NotACounter { obj: ObjectId, key: String },

    /// Counter handles are only live inside their change block.
    #[error("counter is read-only outside its change block")]
    CounterReadOnly,

    /// List index past the end of the list.
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// The addressed object is not in the document.
    #[error("object {0} is not in the document")]
    MissingObject(ObjectId),

    /// The addressed object is not the expected kind of node.
    #[error("object {obj} is not a {expected}")]
    WrongNodeKind {
        obj: ObjectId,
        expected: &'static str,
    },

    /// Undo requested with nothing to undo.
    #[error("nothing to undo")]
    NothingToUndo,

    /// Redo requested with nothing to redo.
    #[error("nothing to redo")]
    NothingToRedo,
}

/// Error raised while folding a backend patch into the document.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum PatchError {
    /// An acknowledgment arrived out of order relative to the local queue.
    #[error("mismatched sequence: patch acknowledges seq {got}, head request is seq {expected:?}")]
    MismatchedSequence { expected: Option<u64>, got: u64 },

    /// Required diff fields missing, or fields inconsistent with the action.
    #[error("malformed patch: {reason}")]
    Malformed { reason: String },

    /// A diff referenced an object the cache does not contain.
    #[error("patch references unknown object {0}")]
    MissingObject(ObjectId),

    /// A diff addressed a list index past the end of the list.
    #[error("diff index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A diff edited a node of the wrong kind for its action.
    #[error("object {obj} is not a {expected}")]
    WrongNodeKind {
        obj: ObjectId,
        expected: &'static str,
    },

    /// An `inc` targeted a field that does not hold a counter.
    #[error("field {key:?} of object {obj} is not a counter")]
    NotACounter { obj: ObjectId, key: String },
}

impl PatchError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        PatchError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the canonical capability errors.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error(transparent)]
    Change(#[from] ChangeError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}
