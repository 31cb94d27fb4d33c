//! The per-process communication registry: one scheduler entry per
//! `(connection, publisher, group)` with windowed flow control.
use crate::connection::{ConnectionId, ConnectionRef, ConnectionStatus};
use crate::group::Group;
use crate::xml::XmlElement;
use crate::{Error, Result};
use fnv::FnvHashMap;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Messages in flight per entry before the outer queue starts absorbing.
pub const INNER_LIMIT: usize = 5;

type EntryKey = (ConnectionId, String, String);

#[derive(Debug, Default)]
struct Entry {
    /// Messages not yet handed to the connection.
    outer: VecDeque<XmlElement>,
    /// Messages handed to the connection whose `sent` event is pending.
    inner: usize,
    /// Unregistered while messages were still queued; the entry is freed
    /// once everything drained.
    draining: bool,
}

/// The scheduler multiplexing group messages over shared connections.
pub struct Registry {
    local_id: String,
    connections: FnvHashMap<ConnectionId, (ConnectionRef, String)>,
    entries: FnvHashMap<EntryKey, Entry>,
    /// Per connection, the entries whose messages were handed over, in
    /// send order; `sent` events consume from the front.
    in_flight: FnvHashMap<ConnectionId, VecDeque<(String, String)>>,
}

impl Registry {
    /// Returns a registry for the endpoint identified by `local_id`.
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            connections: FnvHashMap::default(),
            entries: FnvHashMap::default(),
            in_flight: FnvHashMap::default(),
        }
    }

    /// This endpoint's id, used as the publisher of hosted groups.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Makes a connection known, along with the endpoint id of its remote
    /// side.
    pub fn add_connection(&mut self, connection: ConnectionRef, remote_id: impl Into<String>) {
        self.connections
            .insert(connection.id(), (connection, remote_id.into()));
    }

    /// The connection with `id`, if known.
    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionRef> {
        self.connections.get(&id).map(|(c, _)| c)
    }

    /// The remote endpoint id of connection `id`.
    pub fn remote_id(&self, id: ConnectionId) -> Option<&str> {
        self.connections.get(&id).map(|(_, r)| r.as_str())
    }

    /// Forgets a connection and every entry scheduled on it.
    pub fn remove_connection(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        self.entries.retain(|(conn, _, _), _| *conn != id);
        self.in_flight.remove(&id);
    }

    /// Installs the scheduler entry for `group` on `connection`. The
    /// connection must be open. Re-registering a draining entry
    /// reactivates it with its queue intact.
    pub fn register(&mut self, group: &Group, connection: ConnectionId) -> Result<()> {
        let status = self
            .connections
            .get(&connection)
            .map(|(c, _)| c.status())
            .ok_or(Error::ConnectionClosed)?;
        if status != ConnectionStatus::Open {
            return Err(Error::ConnectionClosed);
        }
        let key = entry_key(group, connection);
        match self.entries.get_mut(&key) {
            Some(entry) if entry.draining => {
                trace!(group = group.name(), %connection, "reactivating draining entry");
                entry.draining = false;
                Ok(())
            }
            Some(_) => Err(Error::AlreadyRegistered(group.name().to_owned())),
            None => {
                self.entries.insert(key, Entry::default());
                Ok(())
            }
        }
    }

    /// Removes the entry for `group` on `connection`. An entry with
    /// messages still queued or in flight stays behind in draining state
    /// while the connection lives.
    pub fn unregister(&mut self, group: &Group, connection: ConnectionId) {
        let key = entry_key(group, connection);
        let open = self
            .connections
            .get(&connection)
            .is_some_and(|(c, _)| c.status() == ConnectionStatus::Open);
        if let Some(entry) = self.entries.get_mut(&key) {
            if open && (!entry.outer.is_empty() || entry.inner > 0) {
                entry.draining = true;
            } else {
                self.entries.remove(&key);
            }
        }
    }

    /// Whether an active entry exists for `group` on `connection`.
    pub fn is_registered(&self, group: &Group, connection: ConnectionId) -> bool {
        self.entries
            .get(&entry_key(group, connection))
            .is_some_and(|e| !e.draining)
    }

    /// Queues `message` for `group` on `connection` and transmits as far
    /// as the flow-control window allows.
    pub fn send(&mut self, group: &Group, connection: ConnectionId, message: XmlElement) -> Result<()> {
        let key = entry_key(group, connection);
        let entry = self.entries.get_mut(&key).ok_or(Error::NotSubscribed)?;
        if entry.draining {
            return Err(Error::NotSubscribed);
        }
        entry.outer.push_back(message);
        self.pump(&key)
    }

    /// Sends `message` to every member of `group`, except `except`.
    pub fn send_to_group(
        &mut self,
        group: &Group,
        except: Option<ConnectionId>,
        message: XmlElement,
    ) -> Result<()> {
        for member in group.members() {
            if Some(*member) == except {
                continue;
            }
            self.send(group, *member, message.clone())?;
        }
        Ok(())
    }

    /// Drops every message of `group` on `connection` still in the outer
    /// queue. Messages already handed to the connection cannot be
    /// recalled.
    pub fn cancel_messages(&mut self, group: &Group, connection: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(&entry_key(group, connection)) {
            let dropped = entry.outer.len();
            entry.outer.clear();
            if dropped > 0 {
                debug!(group = group.name(), %connection, dropped, "cancelled queued messages");
            }
        }
    }

    /// Reports that `connection` finished transmitting its oldest pending
    /// message; advances that entry's window.
    pub fn message_sent(&mut self, connection: ConnectionId) -> Result<()> {
        let key = {
            let queue = self
                .in_flight
                .get_mut(&connection)
                .ok_or(Error::NotSubscribed)?;
            let (publisher, name) = queue.pop_front().ok_or(Error::NotSubscribed)?;
            (connection, publisher, name)
        };
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.inner = entry.inner.saturating_sub(1);
            self.pump(&key)?;
            if let Some(entry) = self.entries.get(&key) {
                if entry.draining && entry.outer.is_empty() && entry.inner == 0 {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Unwraps a received `<group>` container: resolves the publisher
    /// (including the `me`/`you` short forms, from the sender's point of
    /// view) and returns it with the group name and payload.
    pub fn receive(
        &self,
        connection: ConnectionId,
        container: &XmlElement,
    ) -> Result<(String, String, Vec<XmlElement>)> {
        if container.name() != "group" {
            return Err(Error::UnexpectedMessage(container.name().to_owned()));
        }
        let name = container.req_attr("name")?.to_owned();
        let publisher = match container.req_attr("publisher")? {
            "me" => self
                .remote_id(connection)
                .ok_or(Error::ConnectionClosed)?
                .to_owned(),
            "you" => self.local_id.clone(),
            other => other.to_owned(),
        };
        Ok((publisher, name, container.children().to_vec()))
    }

    /// Moves queued messages of one entry into the connection while the
    /// in-flight window has room.
    fn pump(&mut self, key: &EntryKey) -> Result<()> {
        loop {
            let (connection_id, publisher, name) = (key.0, &key.1, &key.2);
            let Some(entry) = self.entries.get_mut(key) else {
                return Ok(());
            };
            if entry.inner >= INNER_LIMIT || entry.outer.is_empty() {
                return Ok(());
            }
            let Some(message) = entry.outer.pop_front() else {
                return Ok(());
            };
            entry.inner += 1;
            let (connection, remote_id) = self
                .connections
                .get(&connection_id)
                .ok_or(Error::ConnectionClosed)?;
            // Collapse the publisher to the cheap short forms where it
            // names either endpoint.
            let publisher_attr = if *publisher == self.local_id {
                "me".to_owned()
            } else if publisher == remote_id {
                "you".to_owned()
            } else {
                publisher.clone()
            };
            let container = XmlElement::new("group")
                .with_attr("name", name.clone())
                .with_attr("publisher", publisher_attr)
                .with_child(message);
            connection.clone().send(container)?;
            self.in_flight
                .entry(connection_id)
                .or_default()
                .push_back((publisher.clone(), name.clone()));
        }
    }
}

fn entry_key(group: &Group, connection: ConnectionId) -> EntryKey {
    (
        connection,
        group.publisher().to_owned(),
        group.name().to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConnection;
    use std::sync::Arc;

    fn setup() -> (Registry, Group, Arc<LoopbackConnection>) {
        let mut registry = Registry::new("server");
        let conn = Arc::new(LoopbackConnection::new(ConnectionId(1), "client".into()));
        registry.add_connection(conn.clone(), "client");
        let mut group = Group::hosted("doc", "server");
        group.add_member(ConnectionId(1));
        registry.register(&group, ConnectionId(1)).unwrap();
        (registry, group, conn)
    }

    #[test]
    fn window_limits_in_flight_messages() {
        let (mut registry, group, conn) = setup();
        for i in 0..12 {
            registry
                .send(&group, ConnectionId(1), XmlElement::new(format!("m{}", i)))
                .unwrap();
        }
        // Exactly the window size reaches the connection up front.
        assert_eq!(conn.queued(), INNER_LIMIT);

        registry.message_sent(ConnectionId(1)).unwrap();
        registry.message_sent(ConnectionId(1)).unwrap();
        // Two sent events admit two more; five remain queued outside.
        assert_eq!(conn.queued(), INNER_LIMIT + 2);
        let delivered = conn.take_outgoing();
        assert_eq!(delivered.len(), 7);
        assert_eq!(delivered[0].children()[0].name(), "m0");
        assert_eq!(delivered[6].children()[0].name(), "m6");
    }

    #[test]
    fn container_collapses_publisher_to_me() {
        let (mut registry, group, conn) = setup();
        registry
            .send(&group, ConnectionId(1), XmlElement::new("payload"))
            .unwrap();
        let sent = conn.take_outgoing();
        assert_eq!(sent[0].name(), "group");
        assert_eq!(sent[0].attr("name"), Some("doc"));
        assert_eq!(sent[0].attr("publisher"), Some("me"));
    }

    #[test]
    fn receive_resolves_short_publisher_forms() {
        let (registry, _group, _conn) = setup();
        let container = XmlElement::new("group")
            .with_attr("name", "doc")
            .with_attr("publisher", "me")
            .with_child(XmlElement::new("payload"));
        // "me" from the remote's point of view is the remote itself.
        let (publisher, name, children) =
            registry.receive(ConnectionId(1), &container).unwrap();
        assert_eq!(publisher, "client");
        assert_eq!(name, "doc");
        assert_eq!(children.len(), 1);

        let container = XmlElement::new("group")
            .with_attr("name", "doc")
            .with_attr("publisher", "you")
            .with_child(XmlElement::new("payload"));
        let (publisher, _, _) = registry.receive(ConnectionId(1), &container).unwrap();
        assert_eq!(publisher, "server");
    }

    #[test]
    fn unregister_with_pending_messages_drains() {
        let (mut registry, group, conn) = setup();
        for _ in 0..7 {
            registry
                .send(&group, ConnectionId(1), XmlElement::new("m"))
                .unwrap();
        }
        registry.unregister(&group, ConnectionId(1));
        // Draining entries refuse fresh sends but finish delivery.
        assert!(registry
            .send(&group, ConnectionId(1), XmlElement::new("late"))
            .is_err());
        for _ in 0..7 {
            registry.message_sent(ConnectionId(1)).unwrap();
        }
        assert!(!registry.is_registered(&group, ConnectionId(1)));
        // Fully drained: the entry is gone, a new registration starts
        // fresh.
        registry.register(&group, ConnectionId(1)).unwrap();
        assert_eq!(conn.take_outgoing().len(), 7);
    }

    #[test]
    fn reregistering_a_draining_entry_reactivates_it() {
        let (mut registry, group, _conn) = setup();
        registry
            .send(&group, ConnectionId(1), XmlElement::new("m"))
            .unwrap();
        registry.unregister(&group, ConnectionId(1));
        registry.register(&group, ConnectionId(1)).unwrap();
        assert!(registry.is_registered(&group, ConnectionId(1)));
        // Double registration of an active entry is an error.
        assert!(matches!(
            registry.register(&group, ConnectionId(1)),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn cancel_drops_only_unsent_messages() {
        let (mut registry, group, conn) = setup();
        for _ in 0..8 {
            registry
                .send(&group, ConnectionId(1), XmlElement::new("m"))
                .unwrap();
        }
        registry.cancel_messages(&group, ConnectionId(1));
        // The five in-flight messages were already with the connection.
        assert_eq!(conn.queued(), INNER_LIMIT);
        for _ in 0..INNER_LIMIT {
            registry.message_sent(ConnectionId(1)).unwrap();
        }
        // Nothing else follows.
        assert_eq!(conn.queued(), INNER_LIMIT);
    }

    #[test]
    fn closed_connection_rejects_registration() {
        let mut registry = Registry::new("server");
        let conn = Arc::new(LoopbackConnection::new(ConnectionId(9), "x".into()));
        conn.set_status(crate::connection::ConnectionStatus::Closed);
        registry.add_connection(conn, "x");
        let group = Group::hosted("doc", "server");
        assert!(matches!(
            registry.register(&group, ConnectionId(9)),
            Err(Error::ConnectionClosed)
        ));
    }
}
