//! # weft — collaborative editing sessions over XML streams
//!
//! ## Requests, state vectors and convergence
//! The heart of the system is the operational-transformation core in
//! [`weft_ot`]: every edit is a request stamped with a state vector, and
//! concurrent requests are transformed against each other so that replicas
//! applying the same set of requests converge to byte-identical buffers.
//! This crate wraps that core with everything needed to run it between
//! real endpoints: sessions, users, groups and a wire format.
//!
//! ## Sessions
//! A [`Session`] is a small state machine: it synchronises initial state
//! (`sync-begin` … `sync-end`/`sync-ack`), tracks its participants in a
//! [`UserTable`], dispatches inbound messages by tag name and emits
//! [`Outbound`] messages for its owner to route. The document-specific
//! half lives behind the [`SessionDocument`] trait with two
//! implementations: [`TextSession`] (OT-backed text buffers) and
//! [`ChatSession`] (a backlog-bearing message stream).
//!
//! Sessions never talk to sockets themselves. They produce outbound
//! messages and consume inbound elements; the process hosting them routes
//! between sessions and the communication registry. This keeps every state
//! machine synchronous, deterministic and testable with the in-memory
//! [`LoopbackConnection`].
//!
//! ## Communication
//! Messages travel in `<group name="…" publisher="…">` containers. A
//! [`Group`] names a broadcast domain and its publisher; the publisher
//! identifier collapses to `"me"`/`"you"` on the wire when it names either
//! endpoint of the connection. The [`Registry`] schedules group messages
//! over shared connections: each `(connection, publisher, group)` entry
//! carries an outer queue and an in-flight window of at most
//! [`INNER_LIMIT`] messages, so one busy group cannot monopolise a
//! connection. Unregistered entries with queued traffic drain before they
//! disappear.
//!
//! ## Access control
//! Directory servers gate operations through the mask/sheet algebra in
//! [`weft_acl`]; the error taxonomy in this crate maps every failure onto
//! the `request-failed` wire form with a stable `(domain, code)` pair.
//! Transformation failures abort a single request, protocol violations
//! close the offending connection, and synchronisation failures close only
//! the synchronising side.

#![warn(missing_docs)]

mod chat;
mod connection;
mod error;
mod group;
mod registry;
mod session;
mod text;
mod user;
mod xml;

pub use crate::chat::{ChatMessage, ChatMessageKind, ChatSession};
pub use crate::connection::{
    Connection, ConnectionId, ConnectionRef, ConnectionStatus, LoopbackConnection,
};
pub use crate::error::{Error, Result};
pub use crate::group::{Group, MethodKind};
pub use crate::registry::{Registry, INNER_LIMIT};
pub use crate::session::{
    user_from_xml, user_to_xml, DocumentContext, Outbound, Session, SessionDocument, SessionRole,
    SessionStatus, SyncStatus,
};
pub use crate::text::{request_from_xml, request_to_xml, TextSession};
pub use crate::user::{JoinParams, User, UserStatus, UserTable};
pub use crate::xml::{XmlElement, XmlStream};

pub use weft_acl as acl;
pub use weft_ot as ot;
