//! # The weft operational transformation core
//!
//! ## Requests and state vectors
//! Every user action is wrapped in a [`Request`]: a `Do` carrying a buffer
//! operation, or an `Undo`/`Redo` whose effective operation is recovered
//! from that user's [`RequestLog`]. Each request is stamped with the
//! [`StateVector`] it was issued at, a mapping from user id to the number of
//! that user's requests already incorporated into the issuer's state.
//! Comparing vectors yields the causal order of two requests; requests
//! whose vectors are incomparable are concurrent.
//!
//! ## Convergence
//! Concurrent operations are transformed against each other before they are
//! applied, so that replicas which have applied the same set of requests
//! hold byte-identical buffers regardless of delivery order. For two
//! concurrent operations `a` and `b`:
//!
//! ```text
//! apply(apply(s, a), transform(b, a)) == apply(apply(s, b), transform(a, b))
//! ```
//!
//! Position ties between concurrent inserts are broken by comparing user
//! ids, which keeps the transformation deterministic across replicas.
//!
//! ## Authorship
//! Buffer content is a [`TextChunk`]: a run of segments, each tagged with
//! the user that typed it. Transformation of a delete that spans foreign
//! text preserves the original authorship, so undo restores not just the
//! bytes but who wrote them.
//!
//! ## The adopted algorithm
//! [`Algorithm`] ties the pieces together. Local edits enter through
//! [`Algorithm::execute_request`] and come back out as requests to
//! broadcast; remote requests enter through [`Algorithm::receive_request`]
//! and are translated to the current state before they touch the buffer.
//! Requests that arrive before their causal prerequisites fail with
//! [`Error::CausalityViolated`] and are expected to be retried by the
//! caller once the state has advanced. Logs grow until [`Algorithm::vacuum`]
//! truncates the prefix that every participant is known to have seen.

#![warn(missing_docs)]

mod algorithm;
mod buffer;
mod chunk;
mod error;
mod log;
mod operation;
mod request;
mod vector;

pub use crate::algorithm::Algorithm;
pub use crate::buffer::{BufferEvent, SubscriptionId, TextBuffer};
pub use crate::chunk::{Segment, TextChunk};
pub use crate::error::Error;
pub use crate::log::RequestLog;
pub use crate::operation::TextOperation;
pub use crate::request::{Request, RequestKind};
pub use crate::vector::{StateVector, VectorOrder};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies a user within one session.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UserId(pub u32);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for UserId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
