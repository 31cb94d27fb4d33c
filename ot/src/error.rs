use crate::UserId;
use thiserror::Error;

/// Errors produced by the transformation core.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// A state vector component would become negative, or a wire-encoded
    /// vector failed to parse.
    #[error("invalid state vector: {0}")]
    InvalidVector(String),
    /// An operation does not fit the buffer it is applied to.
    #[error("operation does not fit buffer: {0}")]
    InvalidOperation(String),
    /// A request is malformed or references log state that does not exist.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A request was delivered before its causal prerequisites.
    #[error("request from user {user} violates causality")]
    CausalityViolated {
        /// The issuing user.
        user: UserId,
    },
    /// A request with this vector was already applied.
    #[error("duplicate request from user {user}")]
    DuplicateRequest {
        /// The issuing user.
        user: UserId,
    },
    /// The user has no request left to undo.
    #[error("user {0} has nothing to undo")]
    NothingToUndo(UserId),
    /// The user has no undo left to redo.
    #[error("user {0} has nothing to redo")]
    NothingToRedo(UserId),
    /// The user is not part of this session.
    #[error("unknown user {0}")]
    UnknownUser(UserId),
}
