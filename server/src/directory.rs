//! The hierarchical document directory: tree, per-node ACL sheets,
//! connection views and session lifecycle.
use crate::accounts::AccountStore;
use fnv::{FnvHashMap, FnvHashSet};
use tracing::{debug, info, warn};
use weft::{
    ChatSession, ConnectionId, Error, Group, MethodKind, Outbound, Registry, Result, Session,
    SessionStatus, TextSession, XmlElement,
};
use weft_acl::{
    effective_permission, verify_root_sheets, AccountId, AclSheet, AclSheetSet, Permission,
    PermissionMask,
};

/// Identifies a directory node within one server.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// An inner node holding children.
    Subdirectory,
    /// A collaboratively edited text document.
    Document,
}

impl NodeKind {
    fn wire(self) -> &'static str {
        match self {
            NodeKind::Subdirectory => "subdirectory",
            NodeKind::Document => "text",
        }
    }
}

enum NodePayload {
    Subdirectory {
        children: Vec<NodeId>,
    },
    Document {
        session: Session<TextSession>,
        group: Group,
    },
}

struct Node {
    id: NodeId,
    parent: Option<NodeId>,
    name: String,
    payload: NodePayload,
    sheets: AclSheetSet,
}

impl Node {
    fn kind(&self) -> NodeKind {
        match &self.payload {
            NodePayload::Subdirectory { .. } => NodeKind::Subdirectory,
            NodePayload::Document { .. } => NodeKind::Document,
        }
    }
}

struct View {
    account: AccountId,
    explored: FnvHashSet<NodeId>,
}

/// The server-side directory: a tree of subdirectories and documents,
/// one hosted communication group per document session, per-connection
/// views and the server-wide chat.
pub struct Directory {
    nodes: FnvHashMap<NodeId, Node>,
    root: NodeId,
    next_id: u32,
    views: FnvHashMap<ConnectionId, View>,
    group: Group,
    chat: Session<ChatSession>,
    chat_group: Group,
    default_account: AccountId,
}

/// The name of the directory's own communication group.
pub const DIRECTORY_GROUP: &str = "directory";
/// The name of the server-wide chat group.
pub const CHAT_GROUP: &str = "chat";

impl Directory {
    /// Creates a directory with an empty root and a permissive default
    /// policy: the default account may do everything in the default set.
    pub fn new(local_id: &str) -> Self {
        let default_account = AccountId::default_account();
        let root = NodeId(0);
        let mut sheets = AclSheetSet::new();
        let mut sheet = AclSheet::new();
        for permission in PermissionMask::default_set().iter() {
            sheet.set(permission, true);
        }
        sheets.set_sheet(default_account.clone(), sheet);
        let mut nodes = FnvHashMap::default();
        nodes.insert(
            root,
            Node {
                id: root,
                parent: None,
                name: String::new(),
                payload: NodePayload::Subdirectory {
                    children: Vec::new(),
                },
                sheets,
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
            views: FnvHashMap::default(),
            group: Group::hosted(DIRECTORY_GROUP, local_id),
            chat: Session::new_host(ChatSession::new()),
            chat_group: Group::hosted(CHAT_GROUP, local_id),
            default_account,
        }
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The directory's own hosted group.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// The server-wide chat session.
    pub fn chat_mut(&mut self) -> &mut Session<ChatSession> {
        &mut self.chat
    }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always at least the root.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Looks up a node id by slash-separated path.
    pub fn resolve_path(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let node = self.nodes.get(&current)?;
            let NodePayload::Subdirectory { children } = &node.payload else {
                return None;
            };
            current = *children
                .iter()
                .find(|c| self.nodes.get(c).is_some_and(|n| n.name == part))?;
        }
        Some(current)
    }

    /// The slash-separated path of a node.
    pub fn node_path(&self, id: NodeId) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.nodes.get(&id)?;
            if node.parent.is_some() {
                parts.push(node.name.clone());
            }
            current = node.parent;
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    /// Registers a connection with its authenticated account, installs the
    /// directory group entry and greets the client.
    pub fn connect(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        account: AccountId,
    ) -> Result<()> {
        self.views.insert(
            connection,
            View {
                account: account.clone(),
                explored: FnvHashSet::default(),
            },
        );
        self.group.add_member(connection);
        registry.register(&self.group, connection)?;
        let welcome = XmlElement::new("welcome")
            .with_attr("protocol-version", "1.0")
            .with_attr("account", account.as_str())
            .with_attr("root", self.root.0);
        registry.send(&self.group, connection, welcome)
    }

    /// Drops a connection: its users go unavailable in every session, its
    /// view disappears.
    pub fn disconnect(&mut self, registry: &mut Registry, connection: ConnectionId) {
        self.views.remove(&connection);
        self.group.remove_member(connection);
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            if let Some(node) = self.nodes.get_mut(&id) {
                if let NodePayload::Document { session, group } = &mut node.payload {
                    if group.is_member(connection) {
                        session.unsubscribe(connection);
                        group.remove_member(connection);
                    }
                }
            }
            self.flush_node(registry, id);
        }
        if self.chat_group.is_member(connection) {
            self.chat.unsubscribe(connection);
            self.chat_group.remove_member(connection);
        }
        self.flush_chat(registry);
        registry.remove_connection(connection);
    }

    fn view(&self, connection: ConnectionId) -> Result<&View> {
        self.views.get(&connection).ok_or(Error::NotSubscribed)
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(Error::NoSuchNode(id.0))
    }

    /// Computes the effective permission of `account` at `node` by walking
    /// the sheet chain towards the root.
    pub fn check_permission(
        &self,
        account: &AccountId,
        node: NodeId,
        permission: Permission,
    ) -> bool {
        let mut chain = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let Some(node) = self.nodes.get(&id) else {
                return false;
            };
            chain.push(&node.sheets);
            current = node.parent;
        }
        effective_permission(chain, account, &self.default_account, permission)
    }

    fn require_permission(
        &self,
        connection: ConnectionId,
        node: NodeId,
        permission: Permission,
    ) -> Result<()> {
        let account = self.view(connection)?.account.clone();
        if self.check_permission(&account, node, permission) {
            Ok(())
        } else {
            // Denials never say why.
            Err(Error::NotAuthorized)
        }
    }

    /// Dispatches one message addressed to the directory group.
    pub fn handle_message(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        match element.name() {
            "explore-node" => self.handle_explore(registry, connection, element),
            "add-node" => self.handle_add_node(registry, connection, element),
            "remove-node" => self.handle_remove_node(registry, connection, element),
            "subscribe-session" => self.handle_subscribe_session(registry, connection, element),
            "subscribe-ack" => self.handle_subscribe_ack(registry, connection, element),
            "session-subscribe-nack" => {
                // The client declined the offer; nothing was established.
                let id = NodeId(element.parse_attr("id")?);
                debug!(%id, %connection, "session subscription declined");
                Ok(())
            }
            "subscribe-chat" => self.handle_subscribe_chat(registry, connection),
            "query-acl" => self.handle_query_acl(registry, connection, element),
            "set-acl" => self.handle_set_acl(registry, connection, element),
            other => Err(Error::UnexpectedMessage(other.to_owned())),
        }
    }

    /// Dispatches one message addressed to a document session group.
    pub fn handle_session_message(
        &mut self,
        registry: &mut Registry,
        node_id: NodeId,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let node = self.nodes.get_mut(&node_id).ok_or(Error::NoSuchNode(node_id.0))?;
        let NodePayload::Document { session, .. } = &mut node.payload else {
            return Err(Error::WrongNodeKind(node_id.0));
        };
        let result = session.handle_element(connection, element);
        self.flush_node(registry, node_id);
        result
    }

    /// Dispatches one message addressed to the chat group.
    pub fn handle_chat_message(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let result = self.chat.handle_element(connection, element);
        self.flush_chat(registry);
        result
    }

    /// The node a session group name refers to.
    pub fn node_by_group(&self, group_name: &str) -> Option<NodeId> {
        let id: u32 = group_name.strip_prefix("session-")?.parse().ok()?;
        let id = NodeId(id);
        self.nodes.contains_key(&id).then_some(id)
    }

    fn handle_explore(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let id = NodeId(element.parse_attr("id")?);
        self.require_permission(connection, id, Permission::ExploreNode)?;
        let node = self.node(id)?;
        let NodePayload::Subdirectory { children } = &node.payload else {
            return Err(Error::WrongNodeKind(id.0));
        };
        let children = children.clone();
        registry.send(
            &self.group,
            connection,
            XmlElement::new("explore-begin")
                .with_attr("id", id.0)
                .with_attr("total", children.len()),
        )?;
        for child in &children {
            let child = self.node(*child)?;
            let notice = node_notice(child);
            registry.send(&self.group, connection, notice)?;
        }
        registry.send(
            &self.group,
            connection,
            XmlElement::new("explore-end").with_attr("id", id.0),
        )?;
        if let Some(view) = self.views.get_mut(&connection) {
            view.explored.insert(id);
        }
        Ok(())
    }

    fn handle_add_node(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let parent = NodeId(element.parse_attr("parent")?);
        let name = element.req_attr("name")?.to_owned();
        let kind = match element.req_attr("type")? {
            "subdirectory" => NodeKind::Subdirectory,
            "text" => NodeKind::Document,
            other => {
                return Err(Error::BadAttribute(
                    "type".into(),
                    format!("unknown node type {:?}", other),
                ))
            }
        };
        let permission = match kind {
            NodeKind::Subdirectory => Permission::AddSubdirectory,
            NodeKind::Document => Permission::AddDocument,
        };
        self.require_permission(connection, parent, permission)?;
        let content = element.child("content").map(|c| c.text().to_owned());
        if content.is_some() {
            self.require_permission(connection, parent, Permission::SyncIn)?;
        }
        let id = self.create_node(registry, parent, &name, kind, content)?;
        debug!(%id, name, "node added");
        Ok(())
    }

    /// Creates a node and notifies every connection whose view contains
    /// the parent.
    pub fn create_node(
        &mut self,
        registry: &mut Registry,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        content: Option<String>,
    ) -> Result<NodeId> {
        {
            let parent_node = self.node(parent)?;
            let NodePayload::Subdirectory { children } = &parent_node.payload else {
                return Err(Error::WrongNodeKind(parent.0));
            };
            if children
                .iter()
                .any(|c| self.nodes.get(c).is_some_and(|n| n.name == name))
            {
                return Err(Error::DuplicateNodeName(name.to_owned()));
            }
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let payload = match kind {
            NodeKind::Subdirectory => NodePayload::Subdirectory {
                children: Vec::new(),
            },
            NodeKind::Document => {
                let mut doc = TextSession::new();
                if let Some(content) = content {
                    let seed = weft_ot::TextChunk::from_text(content, weft_ot::UserId(0));
                    doc.algorithm_mut().buffer_mut().restore(seed);
                }
                NodePayload::Document {
                    session: Session::new_host(doc),
                    group: Group::hosted(format!("session-{}", id.0), registry.local_id()),
                }
            }
        };
        let node = Node {
            id,
            parent: Some(parent),
            name: name.to_owned(),
            payload,
            sheets: AclSheetSet::new(),
        };
        let notice = node_notice(&node);
        self.nodes.insert(id, node);
        if let Some(Node {
            payload: NodePayload::Subdirectory { children },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            children.push(id);
        }
        self.notify_viewers_of(registry, parent, notice);
        Ok(id)
    }

    fn handle_remove_node(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let id = NodeId(element.parse_attr("id")?);
        self.require_permission(connection, id, Permission::RemoveNode)?;
        self.remove_node(registry, id)
    }

    /// Removes `id` and everything beneath it, closing affected sessions.
    pub fn remove_node(&mut self, registry: &mut Registry, id: NodeId) -> Result<()> {
        if id == self.root {
            return Err(Error::WrongNodeKind(id.0));
        }
        let parent = self.node(id)?.parent;
        let mut doomed = vec![id];
        let mut index = 0;
        while index < doomed.len() {
            if let Some(node) = self.nodes.get(&doomed[index]) {
                if let NodePayload::Subdirectory { children } = &node.payload {
                    doomed.extend(children.iter().copied());
                }
            }
            index += 1;
        }
        // Close leaf sessions first.
        for target in doomed.iter().rev() {
            if let Some(node) = self.nodes.get_mut(target) {
                if let NodePayload::Document { session, .. } = &mut node.payload {
                    session.close();
                }
            }
            self.flush_node(registry, *target);
            if let Some(node) = self.nodes.remove(target) {
                if let NodePayload::Document { group, .. } = node.payload {
                    for member in group.members() {
                        registry.unregister(&group, *member);
                    }
                }
                for view in self.views.values_mut() {
                    view.explored.remove(target);
                }
            }
        }
        if let Some(parent) = parent {
            if let Some(Node {
                payload: NodePayload::Subdirectory { children },
                ..
            }) = self.nodes.get_mut(&parent)
            {
                children.retain(|c| *c != id);
            }
            self.notify_viewers_of(
                registry,
                parent,
                XmlElement::new("remove-node").with_attr("id", id.0),
            );
        }
        info!(%id, "node removed");
        Ok(())
    }

    fn handle_subscribe_session(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let id = NodeId(element.parse_attr("id")?);
        self.require_permission(connection, id, Permission::SubscribeSession)?;
        let node = self.node(id)?;
        let NodePayload::Document { group, session } = &node.payload else {
            return Err(Error::WrongNodeKind(id.0));
        };
        if session.status() != SessionStatus::Running {
            return Err(Error::InvalidSessionState(
                "closed".into(),
                "running".into(),
            ));
        }
        if group.is_member(connection) {
            return Err(Error::AlreadyRegistered(group.name().to_owned()));
        }
        let notice = XmlElement::new("subscribe-session")
            .with_attr("id", id.0)
            .with_attr("group", group.name())
            .with_attr("method", group.method().name());
        registry.send(&self.group, connection, notice)
    }

    /// The client confirmed a session subscription: install the group
    /// entry and stream the initial state.
    fn handle_subscribe_ack(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let id = NodeId(element.parse_attr("id")?);
        // The ack must follow a granted subscribe: re-check quietly.
        self.require_permission(connection, id, Permission::SubscribeSession)?;
        let node = self.nodes.get_mut(&id).ok_or(Error::NoSuchNode(id.0))?;
        let NodePayload::Document { session, group } = &mut node.payload else {
            return Err(Error::WrongNodeKind(id.0));
        };
        group.add_member(connection);
        registry.register(group, connection)?;
        session.subscribe(connection)?;
        session.synchronize_to(connection)?;
        self.flush_node(registry, id);
        debug!(%id, %connection, "session subscription established");
        Ok(())
    }

    fn handle_subscribe_chat(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
    ) -> Result<()> {
        self.require_permission(connection, self.root, Permission::SubscribeChat)?;
        if self.chat_group.is_member(connection) {
            return Err(Error::AlreadyRegistered(CHAT_GROUP.to_owned()));
        }
        registry.send(
            &self.group,
            connection,
            XmlElement::new("subscribe-chat")
                .with_attr("group", CHAT_GROUP)
                .with_attr("method", MethodKind::Central.name()),
        )?;
        self.chat_group.add_member(connection);
        registry.register(&self.chat_group, connection)?;
        self.chat.subscribe(connection)?;
        self.chat.synchronize_to(connection)?;
        self.flush_chat(registry);
        Ok(())
    }

    /// Dispatches account-management messages on the directory group.
    /// Returns `false` for tags this handler does not cover.
    pub fn handle_account_message(
        &mut self,
        registry: &mut Registry,
        accounts: &mut AccountStore,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<bool> {
        match element.name() {
            "query-acl-account-list" => {
                self.require_permission(connection, self.root, Permission::QueryAccountList)?;
                registry.send(
                    &self.group,
                    connection,
                    XmlElement::new("acl-account-list-begin")
                        .with_attr("total", accounts.len()),
                )?;
                for account in accounts.iter() {
                    registry.send(
                        &self.group,
                        connection,
                        XmlElement::new("add-acl-account")
                            .with_attr("id", account.id.as_str())
                            .with_attr("name", account.name.clone()),
                    )?;
                }
                registry.send(
                    &self.group,
                    connection,
                    XmlElement::new("acl-account-list-end"),
                )?;
                Ok(true)
            }
            "lookup-acl-accounts" => {
                self.require_permission(connection, self.root, Permission::QueryAccountList)?;
                let needle = element.req_attr("name")?;
                let mut reply = XmlElement::new("acl-accounts");
                for account in accounts.iter().filter(|a| a.name.contains(needle)) {
                    reply = reply.with_child(
                        XmlElement::new("account")
                            .with_attr("id", account.id.as_str())
                            .with_attr("name", account.name.clone()),
                    );
                }
                registry.send(&self.group, connection, reply)?;
                Ok(true)
            }
            "create-acl-account" => {
                self.require_permission(connection, self.root, Permission::CreateAccount)?;
                let name = element.req_attr("name")?;
                let id = accounts
                    .create(name, None, None)
                    .map_err(|_| Error::NameInUse(name.to_owned()))?;
                registry.send(
                    &self.group,
                    connection,
                    XmlElement::new("add-acl-account")
                        .with_attr("id", id.as_str())
                        .with_attr("name", name),
                )?;
                Ok(true)
            }
            "remove-acl-account" => {
                self.require_permission(connection, self.root, Permission::RemoveAccount)?;
                let id = AccountId::from(element.req_attr("id")?);
                if !accounts.remove(&id) {
                    return Err(Error::NoSuchAccount(id.as_str().to_owned()));
                }
                registry.send(
                    &self.group,
                    connection,
                    XmlElement::new("remove-acl-account").with_attr("id", id.as_str()),
                )?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn handle_query_acl(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let id = NodeId(element.parse_attr("id")?);
        self.require_permission(connection, id, Permission::QueryAcl)?;
        let node = self.node(id)?;
        let reply = sheets_to_xml(id, &node.sheets);
        registry.send(&self.group, connection, reply)
    }

    fn handle_set_acl(
        &mut self,
        registry: &mut Registry,
        connection: ConnectionId,
        element: &XmlElement,
    ) -> Result<()> {
        let id = NodeId(element.parse_attr("id")?);
        self.require_permission(connection, id, Permission::SetAcl)?;
        let node = self.nodes.get_mut(&id).ok_or(Error::NoSuchNode(id.0))?;
        let allowed = meaningful_mask(node.kind(), node.parent.is_none());
        // Merge sheet by sheet; a sheet deciding nothing clears its
        // account's entry.
        for child in element.children() {
            if child.name() != "sheet" {
                return Err(Error::UnexpectedMessage(child.name().to_owned()));
            }
            let (account, mut sheet) = sheet_from_xml(child)?;
            sheet.mask = sheet.mask.and(&allowed);
            sheet.perms = sheet.perms.and(&allowed);
            node.sheets.set_sheet(account, sheet);
        }
        if node.parent.is_none() {
            verify_root_sheets(&node.sheets, &self.default_account)?;
        }
        let broadcast = sheets_to_xml(id, &node.sheets);
        // Everyone entitled to see the ACL learns of the change.
        let viewers: Vec<ConnectionId> = self.views.keys().copied().collect();
        for viewer in viewers {
            let allowed = {
                let account = &self.view(viewer)?.account;
                self.check_permission(account, id, Permission::QueryAcl)
            };
            if allowed {
                registry.send(&self.group, viewer, broadcast.clone())?;
            }
        }
        Ok(())
    }

    /// Pushes `notice` to every connection whose view includes `parent`.
    fn notify_viewers_of(
        &mut self,
        registry: &mut Registry,
        parent: NodeId,
        notice: XmlElement,
    ) {
        let viewers: Vec<ConnectionId> = self
            .views
            .iter()
            .filter(|(_, view)| view.explored.contains(&parent))
            .map(|(conn, _)| *conn)
            .collect();
        for viewer in viewers {
            if let Err(err) = registry.send(&self.group, viewer, notice.clone()) {
                warn!(%viewer, %err, "dropping directory notification");
            }
        }
    }

    /// Routes a document session's queued outbound messages through its
    /// group.
    fn flush_node(&mut self, registry: &mut Registry, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let NodePayload::Document { session, group } = &mut node.payload else {
            return;
        };
        for outbound in session.drain_outbox() {
            let result = match outbound {
                Outbound::Group { except, element } => {
                    registry.send_to_group(group, except, element)
                }
                Outbound::Direct {
                    connection,
                    element,
                } => registry.send(group, connection, element),
            };
            if let Err(err) = result {
                warn!(%id, %err, "dropping session outbound");
            }
        }
    }

    fn flush_chat(&mut self, registry: &mut Registry) {
        for outbound in self.chat.drain_outbox() {
            let result = match outbound {
                Outbound::Group { except, element } => {
                    registry.send_to_group(&self.chat_group, except, element)
                }
                Outbound::Direct {
                    connection,
                    element,
                } => registry.send(&self.chat_group, connection, element),
            };
            if let Err(err) = result {
                warn!(%err, "dropping chat outbound");
            }
        }
    }

    /// Mutable access to a document's session, e.g. for storage.
    pub fn document_session(&self, id: NodeId) -> Option<&Session<TextSession>> {
        match &self.nodes.get(&id)?.payload {
            NodePayload::Document { session, .. } => Some(session),
            _ => None,
        }
    }

    /// Iterates all document nodes.
    pub fn documents(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .values()
            .filter(|n| matches!(n.payload, NodePayload::Document { .. }))
            .map(|n| n.id)
    }

    /// Installs ACL sheets on a node without notification, used at
    /// startup.
    pub fn seed_sheets(&mut self, id: NodeId, sheets: AclSheetSet) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NoSuchNode(id.0))?;
        node.sheets = sheets;
        if node.parent.is_none() {
            verify_root_sheets(&node.sheets, &self.default_account)?;
        }
        Ok(())
    }

    /// Replaces a document's session, used when loading from storage.
    pub fn seed_document(&mut self, id: NodeId, session: Session<TextSession>) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NoSuchNode(id.0))?;
        match &mut node.payload {
            NodePayload::Document {
                session: existing, ..
            } => {
                *existing = session;
                Ok(())
            }
            _ => Err(Error::WrongNodeKind(id.0)),
        }
    }
}

fn node_notice(node: &Node) -> XmlElement {
    XmlElement::new("add-node")
        .with_attr("id", node.id.0)
        .with_attr("parent", node.parent.map(|p| p.0).unwrap_or(0))
        .with_attr("name", node.name.clone())
        .with_attr("type", node.kind().wire())
}

/// The permissions that make sense on a node of this kind.
fn meaningful_mask(kind: NodeKind, is_root: bool) -> PermissionMask {
    if is_root {
        return PermissionMask::all();
    }
    match kind {
        NodeKind::Subdirectory => PermissionMask::all()
            .and_not(&PermissionMask::root_set())
            .and_not(&PermissionMask::leaf_set()),
        NodeKind::Document => PermissionMask::all()
            .and_not(&PermissionMask::root_set())
            .and_not(&PermissionMask::subdirectory_set()),
    }
}

/// `<set-acl id><sheet id can-…="yes|no"/>…</set-acl>`
fn sheets_to_xml(id: NodeId, sheets: &AclSheetSet) -> XmlElement {
    let mut element = XmlElement::new("set-acl").with_attr("id", id.0);
    for (account, sheet) in sheets.iter() {
        let mut entry = XmlElement::new("sheet").with_attr("id", account.as_str());
        for permission in sheet.mask.iter() {
            let value = if sheet.perms.has(permission) {
                "yes"
            } else {
                "no"
            };
            entry = entry.with_attr(permission.name(), value);
        }
        element = element.with_child(entry);
    }
    element
}

fn sheet_from_xml(element: &XmlElement) -> Result<(AccountId, AclSheet)> {
    let account = AccountId::from(element.req_attr("id")?);
    let mut sheet = AclSheet::new();
    for (name, value) in element.attrs() {
        if name == "id" {
            continue;
        }
        let permission =
            Permission::from_name(name).map_err(weft::Error::Acl)?;
        match value {
            "yes" => sheet.set(permission, true),
            "no" => sheet.set(permission, false),
            other => {
                return Err(Error::BadAttribute(
                    name.to_owned(),
                    format!("expected yes or no, got {:?}", other),
                ))
            }
        }
    }
    Ok((account, sheet))
}
