//! The connection seam between the session machinery and the transport.
use crate::xml::XmlElement;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies one transport connection within the process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// Handshake in progress; no messages may be sent yet.
    Opening,
    /// Fully established.
    Open,
    /// Local close requested; flushing.
    Closing,
    /// Gone.
    Closed,
}

/// A transport connection as the library sees it: an ordered, non-blocking
/// message sink. Completion of sends is reported out of band by the
/// transport calling back into the registry.
pub trait Connection: Send + Sync {
    /// The process-unique id.
    fn id(&self) -> ConnectionId;
    /// The current lifecycle state.
    fn status(&self) -> ConnectionStatus;
    /// Queues one message for transmission. Must not block.
    fn send(&self, element: XmlElement) -> Result<()>;
    /// A human-readable peer identifier for logging.
    fn remote_identifier(&self) -> String;
}

/// Shared handle to a connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// An in-memory connection for tests and local sessions: two ends joined
/// by queues, pumped manually.
pub struct LoopbackConnection {
    id: ConnectionId,
    peer: String,
    status: AtomicU8,
    outgoing: Mutex<VecDeque<XmlElement>>,
}

impl LoopbackConnection {
    /// Returns both ends of a loopback pair.
    pub fn pair(a: ConnectionId, b: ConnectionId) -> (Arc<Self>, Arc<Self>) {
        let left = Arc::new(Self::new(a, format!("loopback:{}", b)));
        let right = Arc::new(Self::new(b, format!("loopback:{}", a)));
        (left, right)
    }

    /// Returns a single open end.
    pub fn new(id: ConnectionId, peer: String) -> Self {
        Self {
            id,
            peer,
            status: AtomicU8::new(status_to_u8(ConnectionStatus::Open)),
            outgoing: Mutex::new(VecDeque::new()),
        }
    }

    /// Takes every message queued since the last call.
    pub fn take_outgoing(&self) -> Vec<XmlElement> {
        self.outgoing.lock().unwrap().drain(..).collect()
    }

    /// The number of queued messages.
    pub fn queued(&self) -> usize {
        self.outgoing.lock().unwrap().len()
    }

    /// Moves the connection to a new lifecycle state.
    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status_to_u8(status), Ordering::SeqCst);
    }
}

impl Connection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn status(&self) -> ConnectionStatus {
        status_from_u8(self.status.load(Ordering::SeqCst))
    }

    fn send(&self, element: XmlElement) -> Result<()> {
        if self.status() != ConnectionStatus::Open {
            return Err(Error::ConnectionClosed);
        }
        self.outgoing.lock().unwrap().push_back(element);
        Ok(())
    }

    fn remote_identifier(&self) -> String {
        self.peer.clone()
    }
}

fn status_to_u8(status: ConnectionStatus) -> u8 {
    match status {
        ConnectionStatus::Opening => 0,
        ConnectionStatus::Open => 1,
        ConnectionStatus::Closing => 2,
        ConnectionStatus::Closed => 3,
    }
}

fn status_from_u8(status: u8) -> ConnectionStatus {
    match status {
        0 => ConnectionStatus::Opening,
        1 => ConnectionStatus::Open,
        2 => ConnectionStatus::Closing,
        _ => ConnectionStatus::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_queues_until_taken() {
        let (a, _b) = LoopbackConnection::pair(ConnectionId(1), ConnectionId(2));
        a.send(XmlElement::new("one")).unwrap();
        a.send(XmlElement::new("two")).unwrap();
        assert_eq!(a.queued(), 2);
        let taken = a.take_outgoing();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].name(), "one");
        assert_eq!(a.queued(), 0);
    }

    #[test]
    fn closed_loopback_rejects_sends() {
        let conn = LoopbackConnection::new(ConnectionId(1), "test".into());
        conn.set_status(ConnectionStatus::Closed);
        assert!(matches!(
            conn.send(XmlElement::new("x")),
            Err(Error::ConnectionClosed)
        ));
    }
}
