//! Server-side pieces of weft: the document directory, account store,
//! filesystem persistence and the TCP/TLS transport, assembled by the
//! `weftd` binary.

pub mod accounts;
pub mod directory;
pub mod server;
pub mod storage;
pub mod transport;

pub use crate::accounts::{Account, AccountStore, PasswordHash};
pub use crate::directory::{Directory, NodeId, NodeKind, CHAT_GROUP, DIRECTORY_GROUP};
pub use crate::server::Server;
pub use crate::storage::Storage;
pub use crate::transport::{NetConnection, NetEvent, SecurityPolicy};
