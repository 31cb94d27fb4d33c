//! Communication groups: named broadcast domains with a publisher.
use crate::connection::ConnectionId;

/// Per-network routing strategy of a group. The central method routes
/// every message through the publisher, which relays to the remaining
/// members; it is the only strategy every endpoint must support.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MethodKind {
    /// Relay via the publisher.
    #[default]
    Central,
}

impl MethodKind {
    /// The wire name carried in `subscribe-session` messages.
    pub fn name(self) -> &'static str {
        match self {
            MethodKind::Central => "central",
        }
    }
}

/// A named set of participants over which messages are broadcast,
/// identified by `(publisher, name)`.
///
/// A hosted group is published by this process and lists every subscribed
/// connection as a member; the publisher itself is always part of its own
/// hosted groups. A joined group was subscribed to over exactly one
/// connection, the one leading towards the publisher.
#[derive(Clone, Debug)]
pub struct Group {
    name: String,
    publisher: String,
    hosted: bool,
    method: MethodKind,
    members: Vec<ConnectionId>,
}

impl Group {
    /// Creates a group hosted by this process under `local_id`.
    pub fn hosted(name: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            publisher: local_id.into(),
            hosted: true,
            method: MethodKind::Central,
            members: Vec::new(),
        }
    }

    /// Creates the local view of a group published elsewhere, reached
    /// through `connection`.
    pub fn joined(
        name: impl Into<String>,
        publisher: impl Into<String>,
        connection: ConnectionId,
    ) -> Self {
        Self {
            name: name.into(),
            publisher: publisher.into(),
            hosted: false,
            method: MethodKind::Central,
            members: vec![connection],
        }
    }

    /// The group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The publisher's endpoint id.
    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    /// Whether this process publishes the group.
    pub fn is_hosted(&self) -> bool {
        self.hosted
    }

    /// The routing strategy.
    pub fn method(&self) -> MethodKind {
        self.method
    }

    /// Member connections. For a joined group this is the single
    /// connection towards the publisher.
    pub fn members(&self) -> &[ConnectionId] {
        &self.members
    }

    /// Whether `connection` is a member.
    pub fn is_member(&self, connection: ConnectionId) -> bool {
        self.members.contains(&connection)
    }

    /// Adds a member connection. Only meaningful on hosted groups.
    pub fn add_member(&mut self, connection: ConnectionId) {
        if !self.members.contains(&connection) {
            self.members.push(connection);
        }
    }

    /// Removes a member connection.
    pub fn remove_member(&mut self, connection: ConnectionId) {
        self.members.retain(|c| *c != connection);
    }

    /// The members a received group-scope message must be relayed to by
    /// the central method: everyone but the origin, and only when this
    /// process is the publisher.
    pub fn relay_targets(&self, origin: ConnectionId) -> Vec<ConnectionId> {
        if !self.hosted {
            return Vec::new();
        }
        self.members
            .iter()
            .copied()
            .filter(|c| *c != origin)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_group_relays_to_everyone_but_origin() {
        let mut group = Group::hosted("doc-1", "server");
        group.add_member(ConnectionId(1));
        group.add_member(ConnectionId(2));
        group.add_member(ConnectionId(3));
        group.add_member(ConnectionId(2));
        assert_eq!(group.members().len(), 3);
        assert_eq!(
            group.relay_targets(ConnectionId(2)),
            vec![ConnectionId(1), ConnectionId(3)]
        );
    }

    #[test]
    fn joined_group_never_relays() {
        let group = Group::joined("doc-1", "server", ConnectionId(1));
        assert!(group.relay_targets(ConnectionId(1)).is_empty());
        assert!(group.is_member(ConnectionId(1)));
    }
}
