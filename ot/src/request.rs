//! Requests: one user action stamped with the state it was issued at.
use crate::{Error, Result, StateVector, TextOperation, UserId};

/// The action kind. Only `Do` carries an operation; the effective
/// operation of an `Undo` or `Redo` is recovered from the issuing user's
/// request log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestKind {
    /// Apply a fresh operation.
    Do(TextOperation),
    /// Revert this user's most recent not-yet-undone request.
    Undo,
    /// Reapply this user's most recent not-yet-redone undo.
    Redo,
}

/// An immutable record of one user action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    user: UserId,
    vector: StateVector,
    kind: RequestKind,
}

impl Request {
    /// Builds a `Do` request for `operation` issued by `user` at `vector`.
    pub fn new_do(user: UserId, vector: StateVector, operation: TextOperation) -> Self {
        Self {
            user,
            vector,
            kind: RequestKind::Do(operation),
        }
    }

    /// Builds an `Undo` request issued by `user` at `vector`.
    pub fn new_undo(user: UserId, vector: StateVector) -> Self {
        Self {
            user,
            vector,
            kind: RequestKind::Undo,
        }
    }

    /// Builds a `Redo` request issued by `user` at `vector`.
    pub fn new_redo(user: UserId, vector: StateVector) -> Self {
        Self {
            user,
            vector,
            kind: RequestKind::Redo,
        }
    }

    /// The issuing user.
    pub fn user(&self) -> UserId {
        self.user
    }

    /// The state the request was issued at. Its component for the issuing
    /// user equals the number of that user's prior requests.
    pub fn vector(&self) -> &StateVector {
        &self.vector
    }

    /// The action kind.
    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// The stored operation for a `Do` request.
    pub fn operation(&self) -> Option<&TextOperation> {
        match &self.kind {
            RequestKind::Do(operation) => Some(operation),
            _ => None,
        }
    }

    /// The stored operation, or [`Error::InvalidRequest`] for undo/redo.
    pub fn require_operation(&self) -> Result<&TextOperation> {
        self.operation().ok_or_else(|| {
            Error::InvalidRequest("undo/redo requests carry no operation".into())
        })
    }
}
