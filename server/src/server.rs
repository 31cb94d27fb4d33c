//! The server core: one task owning directory, registry and accounts,
//! fed by transport events.
use crate::accounts::AccountStore;
use crate::directory::{Directory, NodeKind, CHAT_GROUP, DIRECTORY_GROUP};
use crate::storage::Storage;
use crate::transport::{NetConnection, NetEvent};
use anyhow::Result;
use fnv::FnvHashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use weft::{Connection, ConnectionId, Error, Registry, XmlElement};
use weft_acl::AccountId;

/// Everything the single core task owns.
pub struct Server {
    registry: Registry,
    directory: Directory,
    accounts: AccountStore,
    storage: Option<Storage>,
    /// Server-wide password; when set, any client presenting it is
    /// admitted under an ephemeral account.
    password: Option<String>,
    connections: FnvHashMap<ConnectionId, Arc<NetConnection>>,
    authenticated: FnvHashMap<ConnectionId, AccountId>,
}

impl Server {
    /// Builds the core with the given collaborators.
    pub fn new(
        local_id: &str,
        accounts: AccountStore,
        storage: Option<Storage>,
        password: Option<String>,
    ) -> Self {
        Self {
            registry: Registry::new(local_id),
            directory: Directory::new(local_id),
            accounts,
            storage,
            password,
            connections: FnvHashMap::default(),
            authenticated: FnvHashMap::default(),
        }
    }

    /// The directory, e.g. for seeding at startup.
    pub fn directory_mut(&mut self) -> &mut Directory {
        &mut self.directory
    }

    /// The registry, e.g. for tests.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Loads the stored document tree into the directory.
    pub fn load_tree(&mut self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut pending = vec![(self.directory.root(), String::new())];
        let mut loaded = 0usize;
        while let Some((node, path)) = pending.pop() {
            for (name, is_dir) in storage.list(&path)? {
                let child_path = format!("{}/{}", path, name);
                if is_dir {
                    let id = self.directory.create_node(
                        &mut self.registry,
                        node,
                        &name,
                        NodeKind::Subdirectory,
                        None,
                    )?;
                    pending.push((id, child_path));
                } else {
                    let id = self.directory.create_node(
                        &mut self.registry,
                        node,
                        &name,
                        NodeKind::Document,
                        None,
                    )?;
                    match storage.load_document(&child_path) {
                        Ok(session) => {
                            self.directory.seed_document(id, session)?;
                            loaded += 1;
                        }
                        Err(err) => warn!(path = child_path, %err, "skipping unreadable document"),
                    }
                }
            }
        }
        info!(documents = loaded, "document tree loaded");
        Ok(())
    }

    /// Writes every document back to storage. Failures are logged and
    /// never fatal.
    pub fn autosave(&mut self) {
        let Some(storage) = &self.storage else {
            return;
        };
        for id in self.directory.documents().collect::<Vec<_>>() {
            let Some(path) = self.directory.node_path(id) else {
                continue;
            };
            let Some(session) = self.directory.document_session(id) else {
                continue;
            };
            if let Err(err) = storage.save_document(&path, session) {
                warn!(%id, %err, "autosave failed");
            }
        }
        if let Err(err) = self.accounts.save() {
            warn!(%err, "account store save failed");
        }
    }

    /// Exports plain-text copies of every document under `target`.
    pub fn sync_to_directory(&self, target: &Path) {
        let Some(storage) = &self.storage else {
            return;
        };
        for id in self.directory.documents() {
            let (Some(path), Some(session)) = (
                self.directory.node_path(id),
                self.directory.document_session(id),
            ) else {
                continue;
            };
            if let Err(err) = storage.export_plaintext(target, &path, session) {
                warn!(%id, %err, "plain-text export failed");
            }
        }
    }

    /// Feeds one transport event through the core.
    pub fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected { connection } => {
                let id = connection.id();
                self.registry
                    .add_connection(connection.clone(), format!("conn-{}", id.0));
                self.connections.insert(id, connection);
                debug!(%id, "awaiting login");
            }
            NetEvent::Sent { id } => {
                let _ = self.registry.message_sent(id);
            }
            NetEvent::Closed { id } => {
                self.authenticated.remove(&id);
                self.connections.remove(&id);
                self.directory.disconnect(&mut self.registry, id);
                info!(%id, "connection closed");
            }
            NetEvent::Message { id, element } => {
                if let Err(err) = self.handle_message(id, &element) {
                    warn!(%id, %err, tag = element.name(), "message failed");
                    self.report_failure(id, &element, &err);
                    if err.closes_connection() {
                        self.close_connection(id);
                    }
                }
            }
        }
    }

    /// An unauthenticated connection may only log in; afterwards every
    /// message must be a group container.
    fn handle_message(&mut self, id: ConnectionId, element: &XmlElement) -> weft::Result<()> {
        if !self.authenticated.contains_key(&id) {
            return self.handle_login(id, element);
        }
        let (publisher, group, children) = self.registry.receive(id, element)?;
        if publisher != self.registry.local_id() {
            // Clients publish no groups of their own towards the server.
            return Err(Error::NotSubscribed);
        }
        for child in children {
            self.route(id, &group, &child)?;
        }
        Ok(())
    }

    fn route(&mut self, id: ConnectionId, group: &str, element: &XmlElement) -> weft::Result<()> {
        match group {
            DIRECTORY_GROUP => {
                if self.directory.handle_account_message(
                    &mut self.registry,
                    &mut self.accounts,
                    id,
                    element,
                )? {
                    return Ok(());
                }
                self.directory
                    .handle_message(&mut self.registry, id, element)
            }
            CHAT_GROUP => self
                .directory
                .handle_chat_message(&mut self.registry, id, element),
            session => {
                let node = self
                    .directory
                    .node_by_group(session)
                    .ok_or(Error::NotSubscribed)?;
                self.directory
                    .handle_session_message(&mut self.registry, node, id, element)
            }
        }
    }

    fn handle_login(&mut self, id: ConnectionId, element: &XmlElement) -> weft::Result<()> {
        if element.name() != "login" {
            return Err(Error::UnexpectedMessage(element.name().to_owned()));
        }
        let name = element.req_attr("name")?;
        let password = element.attr("password");
        let certificate = element.attr("certificate");
        let account = self.authenticate(name, password, certificate)?;
        self.authenticated.insert(id, account.clone());
        self.directory
            .connect(&mut self.registry, id, account.clone())?;
        info!(%id, account = %account, "login accepted");
        Ok(())
    }

    fn authenticate(
        &mut self,
        name: &str,
        password: Option<&str>,
        certificate: Option<&str>,
    ) -> weft::Result<AccountId> {
        if let Some(fingerprint) = certificate {
            if let Some(account) = self.accounts.by_certificate(fingerprint) {
                return Ok(account.id.clone());
            }
        }
        if let Some(password) = password {
            if let Some(account) = self.accounts.authenticate(name, password) {
                return Ok(account);
            }
            // The server-wide password admits anyone under the default
            // account.
            if self.password.as_deref() == Some(password) {
                return Ok(AccountId::default_account());
            }
        }
        // No credentials: the open server admits the default account.
        if password.is_none() && certificate.is_none() && self.password.is_none() {
            return Ok(AccountId::default_account());
        }
        Err(Error::NotAuthorized)
    }

    /// Sends `request-failed` for `err` where a reply channel exists.
    fn report_failure(&mut self, id: ConnectionId, element: &XmlElement, err: &Error) {
        let reply = err.to_request_failed();
        let sent = if element.name() == "group" {
            match self.registry.receive(id, element) {
                Ok((_, group, _)) if group == DIRECTORY_GROUP => self
                    .registry
                    .send(self.directory.group(), id, reply.clone())
                    .is_ok(),
                _ => false,
            }
        } else {
            false
        };
        if !sent {
            if let Some(connection) = self.connections.get(&id) {
                let _ = connection.send(reply);
            }
        }
    }

    fn close_connection(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get(&id) {
            connection.close();
        }
    }
}
