//! The generic session state machine shared by every document type.
use crate::connection::ConnectionId;
use crate::user::{JoinParams, User, UserStatus, UserTable};
use crate::xml::XmlElement;
use crate::{Error, Result};
use fnv::FnvHashMap;
use tracing::{debug, warn};
use weft_ot::UserId;

/// Lifecycle of a session replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    /// Receiving the initial state.
    Synchronizing,
    /// Fully established; requests flow.
    Running,
    /// Shut down; nothing flows anymore.
    Closed,
}

impl SessionStatus {
    fn name(self) -> &'static str {
        match self {
            SessionStatus::Synchronizing => "synchronizing",
            SessionStatus::Running => "running",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Progress of one synchronisation towards or from a connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SyncStatus {
    /// No synchronisation with this connection.
    #[default]
    None,
    /// Payload is being transferred.
    InProgress,
    /// Everything sent; waiting for the ack.
    AwaitingAck,
    /// Acknowledged.
    Complete,
    /// Broke down.
    Failed,
}

/// This replica's relationship to the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionRole {
    /// This process publishes the session and assigns user ids.
    Host,
    /// This process joined a session published elsewhere.
    Joined,
}

/// An outbound message produced by the session, routed by the owner.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// Broadcast to the session's subscription group.
    Group {
        /// Member to skip, usually the origin of the triggering message.
        except: Option<ConnectionId>,
        /// The payload.
        element: XmlElement,
    },
    /// Addressed to a single connection.
    Direct {
        /// The target.
        connection: ConnectionId,
        /// The payload.
        element: XmlElement,
    },
}

/// Document-type-specific half of a session.
pub trait SessionDocument {
    /// Enumerates the synchronisation payload, in the order it must be
    /// transferred.
    fn sync_items(&self) -> Vec<XmlElement>;

    /// Ingests one synchronisation payload element.
    fn ingest_sync_item(&mut self, element: &XmlElement, users: &mut UserTable) -> Result<()>;

    /// Called once the synchronisation count checked out.
    fn finish_sync(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handles a document-specific message. Returns `false` when the tag
    /// is not known to this document type.
    fn handle_message(
        &mut self,
        origin: ConnectionId,
        element: &XmlElement,
        ctx: &mut DocumentContext,
    ) -> Result<bool>;

    /// Observes availability changes, e.g. to synthesise chat entries.
    fn user_status_changed(&mut self, _user: &User, _previous: UserStatus) {}
}

/// Mutable session state handed to [`SessionDocument::handle_message`].
pub struct DocumentContext<'a> {
    /// The participant table.
    pub users: &'a mut UserTable,
    /// Where to queue outbound messages.
    pub outbox: &'a mut Vec<Outbound>,
    /// Whether this replica hosts the session.
    pub is_host: bool,
}

struct IncomingSync {
    connection: ConnectionId,
    expected: Option<usize>,
    received: usize,
}

/// A session: user table, synchronisation machinery, message dispatch and
/// a document payload.
pub struct Session<D: SessionDocument> {
    role: SessionRole,
    status: SessionStatus,
    users: UserTable,
    doc: D,
    subscribers: Vec<ConnectionId>,
    outgoing_syncs: FnvHashMap<ConnectionId, SyncStatus>,
    incoming_sync: Option<IncomingSync>,
    outbox: Vec<Outbound>,
    last_remote_failure: Option<Error>,
}

impl<D: SessionDocument> Session<D> {
    /// Creates a running session hosted by this process.
    pub fn new_host(doc: D) -> Self {
        Self::new(doc, SessionRole::Host, SessionStatus::Running)
    }

    /// Creates a joined session that still awaits its initial state.
    pub fn new_joined(doc: D) -> Self {
        Self::new(doc, SessionRole::Joined, SessionStatus::Synchronizing)
    }

    fn new(doc: D, role: SessionRole, status: SessionStatus) -> Self {
        Self {
            role,
            status,
            users: UserTable::new(),
            doc,
            subscribers: Vec::new(),
            outgoing_syncs: FnvHashMap::default(),
            incoming_sync: None,
            outbox: Vec::new(),
            last_remote_failure: None,
        }
    }

    /// The lifecycle state.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// This replica's role.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// The participant table.
    pub fn users(&self) -> &UserTable {
        &self.users
    }

    pub(crate) fn users_mut(&mut self) -> &mut UserTable {
        &mut self.users
    }

    /// Installs a user record verbatim, e.g. when loading a stored
    /// document. Restored users start unavailable.
    pub fn restore_user(&mut self, mut user: User) -> Result<()> {
        user.status = UserStatus::Unavailable;
        user.connection = None;
        self.users.insert(user)?;
        Ok(())
    }

    /// Turns a replica that was populated through the synchronisation
    /// path into the hosting side, as when a stored document is loaded by
    /// replaying its serialised sync stream. Participants drop to
    /// unavailable; they rejoin over real connections.
    pub fn promote_to_host(&mut self) {
        self.role = SessionRole::Host;
        for id in self.users.iter().map(|u| u.id).collect::<Vec<_>>() {
            if let Some(user) = self.users.get_mut(id) {
                user.status = UserStatus::Unavailable;
                user.connection = None;
            }
        }
    }

    /// The document payload.
    pub fn doc(&self) -> &D {
        &self.doc
    }

    /// Mutable access to the document payload.
    pub fn doc_mut(&mut self) -> &mut D {
        &mut self.doc
    }

    /// Subscribed connections.
    pub fn subscribers(&self) -> &[ConnectionId] {
        &self.subscribers
    }

    /// Synchronisation progress towards `connection`.
    pub fn sync_status(&self, connection: ConnectionId) -> SyncStatus {
        if let Some(incoming) = &self.incoming_sync {
            if incoming.connection == connection {
                return SyncStatus::InProgress;
            }
        }
        self.outgoing_syncs
            .get(&connection)
            .copied()
            .unwrap_or_default()
    }

    /// The most recent `request-failed` received from the remote side.
    pub fn take_remote_failure(&mut self) -> Option<Error> {
        self.last_remote_failure.take()
    }

    /// Takes every outbound message queued since the last call.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Queues a broadcast to the subscription group.
    pub fn broadcast(&mut self, element: XmlElement) {
        self.outbox.push(Outbound::Group {
            except: None,
            element,
        });
    }

    fn require_status(&self, required: SessionStatus) -> Result<()> {
        if self.status != required {
            return Err(Error::InvalidSessionState(
                self.status.name().into(),
                required.name().into(),
            ));
        }
        Ok(())
    }

    /// Adds `connection` to the subscribers. The session must be running.
    pub fn subscribe(&mut self, connection: ConnectionId) -> Result<()> {
        self.require_status(SessionStatus::Running)?;
        if !self.subscribers.contains(&connection) {
            self.subscribers.push(connection);
        }
        Ok(())
    }

    /// Removes `connection`; every user joined through it becomes
    /// unavailable and the change is broadcast.
    pub fn unsubscribe(&mut self, connection: ConnectionId) {
        self.subscribers.retain(|c| *c != connection);
        self.outgoing_syncs.remove(&connection);
        for id in self.users.drop_connection(connection) {
            if let Some(user) = self.users.get(id) {
                let user = user.clone();
                self.doc.user_status_changed(&user, UserStatus::Active);
            }
            self.outbox.push(Outbound::Group {
                except: Some(connection),
                element: XmlElement::new("user-status-change")
                    .with_attr("id", id.0)
                    .with_attr("status", UserStatus::Unavailable.name()),
            });
        }
    }

    /// Joins a local user and broadcasts the join. Only the host assigns
    /// ids; a joined replica instead sends a join request to the host and
    /// completes when the broadcast comes back.
    pub fn join_user(
        &mut self,
        params: JoinParams,
        connection: Option<ConnectionId>,
    ) -> Result<Option<UserId>> {
        self.require_status(SessionStatus::Running)?;
        match self.role {
            SessionRole::Host => {
                let rejoin = self.users.by_name(&params.name).is_some();
                let user = self.users.join(params, connection)?.clone();
                self.doc.user_status_changed(&user, UserStatus::Unavailable);
                let tag = if rejoin { "user-rejoin" } else { "user-join" };
                self.outbox.push(Outbound::Group {
                    except: None,
                    element: user_to_xml(tag, &user),
                });
                Ok(Some(user.id))
            }
            SessionRole::Joined => {
                let element = XmlElement::new("user-join")
                    .with_attr("name", params.name)
                    .with_attr("caret", params.caret)
                    .with_attr("selection", params.selection)
                    .with_attr("hue", params.hue);
                self.outbox.push(Outbound::Group {
                    except: None,
                    element,
                });
                Ok(None)
            }
        }
    }

    /// Streams the current state to `connection`.
    pub fn synchronize_to(&mut self, connection: ConnectionId) -> Result<()> {
        self.require_status(SessionStatus::Running)?;
        let mut payload: Vec<XmlElement> =
            self.users.iter().map(|u| user_to_xml("sync-user", u)).collect();
        payload.extend(self.doc.sync_items());
        self.outbox.push(Outbound::Direct {
            connection,
            element: XmlElement::new("sync-begin").with_attr("n", payload.len()),
        });
        for element in payload {
            self.outbox.push(Outbound::Direct {
                connection,
                element,
            });
        }
        self.outbox.push(Outbound::Direct {
            connection,
            element: XmlElement::new("sync-end"),
        });
        self.outgoing_syncs
            .insert(connection, SyncStatus::AwaitingAck);
        Ok(())
    }

    /// Begins receiving the initial state from `connection`.
    pub fn synchronize_from(&mut self, connection: ConnectionId) -> Result<()> {
        self.require_status(SessionStatus::Synchronizing)?;
        if self.incoming_sync.is_some() {
            return Err(Error::SyncFailed("synchronization already running".into()));
        }
        self.incoming_sync = Some(IncomingSync {
            connection,
            expected: None,
            received: 0,
        });
        Ok(())
    }

    /// Broadcasts `session-close`, cancels synchronisations and closes.
    pub fn close(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        self.outbox.push(Outbound::Group {
            except: None,
            element: XmlElement::new("session-close"),
        });
        for (connection, status) in self.outgoing_syncs.iter_mut() {
            if matches!(status, SyncStatus::InProgress | SyncStatus::AwaitingAck) {
                *status = SyncStatus::Failed;
                self.outbox.push(Outbound::Direct {
                    connection: *connection,
                    element: XmlElement::new("sync-cancel"),
                });
            }
        }
        self.incoming_sync = None;
        self.status = SessionStatus::Closed;
    }

    /// Dispatches one inbound element from `origin`.
    pub fn handle_element(&mut self, origin: ConnectionId, element: &XmlElement) -> Result<()> {
        if self.status == SessionStatus::Closed {
            return Err(Error::InvalidSessionState(
                SessionStatus::Closed.name().into(),
                "any open state".into(),
            ));
        }
        if self.status == SessionStatus::Synchronizing {
            return self.handle_sync_element(origin, element);
        }
        match element.name() {
            "sync-ack" => {
                if let Some(status) = self.outgoing_syncs.get_mut(&origin) {
                    if *status == SyncStatus::AwaitingAck {
                        *status = SyncStatus::Complete;
                        debug!(%origin, "synchronization acknowledged");
                        return Ok(());
                    }
                }
                Err(Error::UnexpectedMessage("sync-ack".into()))
            }
            "sync-cancel" => {
                self.outgoing_syncs.insert(origin, SyncStatus::Failed);
                Ok(())
            }
            "user-join" | "user-rejoin" => self.handle_user_join(origin, element),
            "user-leave" => {
                let id = UserId(element.parse_attr("id")?);
                self.set_user_status(id, UserStatus::Unavailable)?;
                self.rebroadcast(origin, element);
                Ok(())
            }
            "user-status-change" => {
                let id = UserId(element.parse_attr("id")?);
                let status = UserStatus::parse(element.req_attr("status")?)?;
                if let Some(caret) = element.parse_opt_attr("caret")? {
                    if let Some(user) = self.users.get_mut(id) {
                        user.caret = caret;
                    }
                }
                if let Some(selection) = element.parse_opt_attr("selection")? {
                    if let Some(user) = self.users.get_mut(id) {
                        user.selection = selection;
                    }
                }
                self.set_user_status(id, status)?;
                self.rebroadcast(origin, element);
                Ok(())
            }
            "session-unsubscribe" => {
                self.unsubscribe(origin);
                Ok(())
            }
            "session-close" => {
                self.close();
                Ok(())
            }
            "request-failed" => {
                let failure = Error::from_request_failed(element)?;
                warn!(%origin, %failure, "remote reported request failure");
                self.last_remote_failure = Some(failure);
                Ok(())
            }
            _ => {
                let mut ctx = DocumentContext {
                    users: &mut self.users,
                    outbox: &mut self.outbox,
                    is_host: self.role == SessionRole::Host,
                };
                if self.doc.handle_message(origin, element, &mut ctx)? {
                    Ok(())
                } else {
                    Err(Error::UnexpectedMessage(element.name().to_owned()))
                }
            }
        }
    }

    fn handle_sync_element(&mut self, origin: ConnectionId, element: &XmlElement) -> Result<()> {
        let Some(sync) = self.incoming_sync.as_mut() else {
            return Err(Error::SyncFailed("no synchronization in progress".into()));
        };
        if sync.connection != origin {
            return Err(Error::UnexpectedMessage(element.name().to_owned()));
        }
        match element.name() {
            "sync-begin" => {
                if sync.expected.is_some() {
                    return self.fail_sync("duplicate sync-begin");
                }
                match element.parse_attr("n") {
                    Ok(n) => {
                        sync.expected = Some(n);
                        Ok(())
                    }
                    Err(err) => self.fail_sync(&err.to_string()),
                }
            }
            "sync-end" => {
                let Some(expected) = sync.expected else {
                    return self.fail_sync("sync-end before sync-begin");
                };
                if sync.received != expected {
                    return self.fail_sync("synchronization count mismatch");
                }
                let connection = sync.connection;
                self.incoming_sync = None;
                self.doc.finish_sync()?;
                self.status = SessionStatus::Running;
                self.outbox.push(Outbound::Direct {
                    connection,
                    element: XmlElement::new("sync-ack"),
                });
                debug!(%connection, "synchronization complete");
                Ok(())
            }
            "sync-cancel" => self.fail_sync("synchronization cancelled by remote"),
            "sync-user" => {
                if sync.expected.is_none() {
                    return self.fail_sync("payload before sync-begin");
                }
                sync.received += 1;
                let installed = user_from_xml(element)
                    .and_then(|user| self.users.insert(user).map(|_| ()));
                match installed {
                    Ok(()) => Ok(()),
                    Err(err) => self.fail_sync(&err.to_string()),
                }
            }
            _ => {
                if sync.expected.is_none() {
                    return self.fail_sync("payload before sync-begin");
                }
                sync.received += 1;
                match self.doc.ingest_sync_item(element, &mut self.users) {
                    Ok(()) => Ok(()),
                    Err(err) => self.fail_sync(&err.to_string()),
                }
            }
        }
    }

    /// A broken synchronisation closes the synchronising side.
    fn fail_sync(&mut self, reason: &str) -> Result<()> {
        warn!(reason, "synchronization failed");
        self.incoming_sync = None;
        self.status = SessionStatus::Closed;
        Err(Error::SyncFailed(reason.into()))
    }

    fn handle_user_join(&mut self, origin: ConnectionId, element: &XmlElement) -> Result<()> {
        match self.role {
            SessionRole::Host => {
                // Ids and statuses are assigned here, never by the client.
                if element.attr("id").is_some() {
                    return Err(Error::IdProvided);
                }
                if element.attr("status").is_some() {
                    return Err(Error::StatusProvided);
                }
                let params = JoinParams {
                    name: element.attr("name").unwrap_or_default().to_owned(),
                    caret: element.parse_opt_attr("caret")?.unwrap_or(0),
                    selection: element.parse_opt_attr("selection")?.unwrap_or(0),
                    hue: element.parse_opt_attr("hue")?.unwrap_or(0),
                };
                let rejoin = self.users.by_name(&params.name).is_some();
                let user = self.users.join(params, Some(origin))?.clone();
                self.doc.user_status_changed(&user, UserStatus::Unavailable);
                let tag = if rejoin { "user-rejoin" } else { "user-join" };
                self.outbox.push(Outbound::Group {
                    except: None,
                    element: user_to_xml(tag, &user),
                });
                Ok(())
            }
            SessionRole::Joined => {
                // Broadcast from the host: install the user verbatim.
                let user = user_from_xml(element)?;
                let previous = self
                    .users
                    .get(user.id)
                    .map(|u| u.status)
                    .unwrap_or(UserStatus::Unavailable);
                let user = self.users.insert(user)?.clone();
                self.doc.user_status_changed(&user, previous);
                Ok(())
            }
        }
    }

    fn set_user_status(&mut self, id: UserId, status: UserStatus) -> Result<()> {
        let user = self.users.get_mut(id).ok_or(Error::NoSuchUser(id.0))?;
        let previous = user.status;
        user.status = status;
        if status == UserStatus::Unavailable {
            user.connection = None;
        }
        let user = user.clone();
        self.doc.user_status_changed(&user, previous);
        Ok(())
    }

    /// Hosts forward group-scope messages to the other subscribers.
    fn rebroadcast(&mut self, origin: ConnectionId, element: &XmlElement) {
        if self.role == SessionRole::Host {
            self.outbox.push(Outbound::Group {
                except: Some(origin),
                element: element.clone(),
            });
        }
    }
}

/// Serialises a user record under the given tag name.
pub fn user_to_xml(tag: &str, user: &User) -> XmlElement {
    XmlElement::new(tag)
        .with_attr("id", user.id.0)
        .with_attr("name", user.name.clone())
        .with_attr("status", user.status.name())
        .with_attr("caret", user.caret)
        .with_attr("selection", user.selection)
        .with_attr("hue", user.hue)
}

/// Parses a user record as broadcast by a host or stored on disk.
pub fn user_from_xml(element: &XmlElement) -> Result<User> {
    Ok(User {
        id: UserId(element.parse_attr("id")?),
        name: element.req_attr("name")?.to_owned(),
        status: UserStatus::parse(element.req_attr("status")?)?,
        connection: None,
        caret: element.parse_opt_attr("caret")?.unwrap_or(0),
        selection: element.parse_opt_attr("selection")?.unwrap_or(0),
        hue: element.parse_opt_attr("hue")?.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal document: a list of lines, synced one element per line.
    #[derive(Default)]
    struct Lines {
        lines: Vec<String>,
    }

    impl SessionDocument for Lines {
        fn sync_items(&self) -> Vec<XmlElement> {
            self.lines
                .iter()
                .map(|l| XmlElement::new("sync-line").with_text(l.clone()))
                .collect()
        }

        fn ingest_sync_item(
            &mut self,
            element: &XmlElement,
            _users: &mut UserTable,
        ) -> Result<()> {
            if element.name() != "sync-line" {
                return Err(Error::UnexpectedMessage(element.name().to_owned()));
            }
            self.lines.push(element.text().to_owned());
            Ok(())
        }

        fn handle_message(
            &mut self,
            origin: ConnectionId,
            element: &XmlElement,
            ctx: &mut DocumentContext,
        ) -> Result<bool> {
            if element.name() != "line" {
                return Ok(false);
            }
            self.lines.push(element.text().to_owned());
            if ctx.is_host {
                ctx.outbox.push(Outbound::Group {
                    except: Some(origin),
                    element: element.clone(),
                });
            }
            Ok(true)
        }
    }

    fn join(session: &mut Session<Lines>, name: &str, conn: ConnectionId) -> UserId {
        session
            .join_user(
                JoinParams {
                    name: name.into(),
                    ..JoinParams::default()
                },
                Some(conn),
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn synchronization_transfers_users_and_payload() {
        let mut host = Session::new_host(Lines::default());
        host.doc_mut().lines.push("alpha".into());
        host.doc_mut().lines.push("beta".into());
        join(&mut host, "alice", ConnectionId(1));

        let target = ConnectionId(2);
        host.synchronize_to(target).unwrap();
        assert_eq!(host.sync_status(target), SyncStatus::AwaitingAck);

        let mut client = Session::new_joined(Lines::default());
        client.synchronize_from(ConnectionId(7)).unwrap();
        for outbound in host.drain_outbox() {
            let Outbound::Direct {
                connection,
                element,
            } = outbound
            else {
                continue;
            };
            assert_eq!(connection, target);
            client.handle_element(ConnectionId(7), &element).unwrap();
        }
        assert_eq!(client.status(), SessionStatus::Running);
        assert_eq!(client.doc().lines, vec!["alpha", "beta"]);
        assert_eq!(client.users().by_name("alice").unwrap().id, UserId(1));
        // The client acknowledged.
        let acks: Vec<_> = client.drain_outbox();
        assert!(matches!(
            &acks[..],
            [Outbound::Direct { element, .. }] if element.name() == "sync-ack"
        ));
        host.handle_element(target, &XmlElement::new("sync-ack"))
            .unwrap();
        assert_eq!(host.sync_status(target), SyncStatus::Complete);
    }

    #[test]
    fn count_mismatch_fails_and_closes_the_synchronizing_side() {
        let mut client = Session::new_joined(Lines::default());
        let host = ConnectionId(1);
        client.synchronize_from(host).unwrap();
        client
            .handle_element(host, &XmlElement::new("sync-begin").with_attr("n", 3))
            .unwrap();
        client
            .handle_element(host, &XmlElement::new("sync-line").with_text("x"))
            .unwrap();
        let result = client.handle_element(host, &XmlElement::new("sync-end"));
        assert!(matches!(result, Err(Error::SyncFailed(_))));
        assert_eq!(client.status(), SessionStatus::Closed);
    }

    #[test]
    fn host_assigns_ids_and_rejects_provided_ones() {
        let mut host = Session::new_host(Lines::default());
        let join_msg = XmlElement::new("user-join").with_attr("name", "bob");
        host.handle_element(ConnectionId(3), &join_msg).unwrap();
        let out = host.drain_outbox();
        let Outbound::Group { element, .. } = &out[0] else {
            panic!("expected group broadcast");
        };
        assert_eq!(element.name(), "user-join");
        assert_eq!(element.attr("id"), Some("1"));
        assert_eq!(element.attr("status"), Some("active"));

        let bad = XmlElement::new("user-join")
            .with_attr("name", "eve")
            .with_attr("id", 5);
        assert!(matches!(
            host.handle_element(ConnectionId(3), &bad),
            Err(Error::IdProvided)
        ));
    }

    #[test]
    fn second_join_with_same_name_is_rejected() {
        let mut host = Session::new_host(Lines::default());
        join(&mut host, "alice", ConnectionId(1));
        let result = host.join_user(
            JoinParams {
                name: "alice".into(),
                ..JoinParams::default()
            },
            Some(ConnectionId(2)),
        );
        assert!(matches!(result, Err(Error::NameInUse(_))));
    }

    #[test]
    fn unsubscribe_makes_users_unavailable() {
        let mut host = Session::new_host(Lines::default());
        host.subscribe(ConnectionId(1)).unwrap();
        let id = join(&mut host, "alice", ConnectionId(1));
        host.drain_outbox();
        host.unsubscribe(ConnectionId(1));
        assert_eq!(
            host.users().get(id).unwrap().status,
            UserStatus::Unavailable
        );
        let out = host.drain_outbox();
        assert!(out.iter().any(|o| matches!(
            o,
            Outbound::Group { element, .. }
                if element.name() == "user-status-change"
                    && element.attr("status") == Some("unavailable")
        )));
        // Rejoining afterwards reuses the id.
        let rejoined = join(&mut host, "alice", ConnectionId(2));
        assert_eq!(rejoined, id);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut host = Session::new_host(Lines::default());
        assert!(matches!(
            host.handle_element(ConnectionId(1), &XmlElement::new("bogus")),
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn close_broadcasts_and_cancels_syncs() {
        let mut host = Session::new_host(Lines::default());
        host.synchronize_to(ConnectionId(4)).unwrap();
        host.drain_outbox();
        host.close();
        assert_eq!(host.status(), SessionStatus::Closed);
        let out = host.drain_outbox();
        assert!(out.iter().any(|o| matches!(
            o,
            Outbound::Group { element, .. } if element.name() == "session-close"
        )));
        assert!(out.iter().any(|o| matches!(
            o,
            Outbound::Direct { element, .. } if element.name() == "sync-cancel"
        )));
        assert_eq!(host.sync_status(ConnectionId(4)), SyncStatus::Failed);
        // Everything after close is refused.
        assert!(host.handle_element(ConnectionId(1), &XmlElement::new("line")).is_err());
    }

    #[test]
    fn document_messages_reach_the_document() {
        let mut host = Session::new_host(Lines::default());
        host.subscribe(ConnectionId(1)).unwrap();
        host.subscribe(ConnectionId(2)).unwrap();
        host.handle_element(ConnectionId(1), &XmlElement::new("line").with_text("hi"))
            .unwrap();
        assert_eq!(host.doc().lines, vec!["hi"]);
        // The host relays to the other subscriber.
        let out = host.drain_outbox();
        assert!(matches!(
            &out[..],
            [Outbound::Group { except: Some(origin), .. }] if *origin == ConnectionId(1)
        ));
    }
}
