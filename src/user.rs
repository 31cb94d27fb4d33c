//! Session participants.
use crate::connection::ConnectionId;
use crate::{Error, Result};
use fnv::FnvHashMap;
use std::collections::BTreeMap;
use weft_ot::UserId;

/// Availability of a participant.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UserStatus {
    /// Known to the session but not connected.
    #[default]
    Unavailable,
    /// Connected but idle.
    Inactive,
    /// Connected and editing.
    Active,
}

impl UserStatus {
    /// The wire form.
    pub fn name(self) -> &'static str {
        match self {
            UserStatus::Unavailable => "unavailable",
            UserStatus::Inactive => "inactive",
            UserStatus::Active => "active",
        }
    }

    /// Parses the wire form.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "unavailable" => Ok(UserStatus::Unavailable),
            "inactive" => Ok(UserStatus::Inactive),
            "active" => Ok(UserStatus::Active),
            other => Err(Error::BadAttribute(
                "status".into(),
                format!("unknown status {:?}", other),
            )),
        }
    }
}

/// One participant of a session.
#[derive(Clone, Debug)]
pub struct User {
    /// Session-unique id.
    pub id: UserId,
    /// Display name, unique within the session.
    pub name: String,
    /// Availability.
    pub status: UserStatus,
    /// The connection this user joined through, while available.
    pub connection: Option<ConnectionId>,
    /// Caret position in characters.
    pub caret: usize,
    /// Selected characters following the caret (negative selects
    /// backwards).
    pub selection: i64,
    /// Display hue in degrees.
    pub hue: u16,
}

/// Parameters of a join request, before the session assigns an id.
#[derive(Clone, Debug, Default)]
pub struct JoinParams {
    /// Desired display name.
    pub name: String,
    /// Initial caret position.
    pub caret: usize,
    /// Initial selection length.
    pub selection: i64,
    /// Display hue in degrees.
    pub hue: u16,
}

/// The id- and name-indexed participant table of one session.
#[derive(Clone, Debug, Default)]
pub struct UserTable {
    users: BTreeMap<UserId, User>,
    by_name: FnvHashMap<String, UserId>,
    next_id: u32,
}

impl UserTable {
    /// Returns an empty table.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// The user with `id`.
    pub fn get(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    /// Mutable access to the user with `id`.
    pub fn get_mut(&mut self, id: UserId) -> Option<&mut User> {
        self.users.get_mut(&id)
    }

    /// The user with `id`, or [`Error::NoSuchUser`].
    pub fn require(&self, id: UserId) -> Result<&User> {
        self.get(id).ok_or(Error::NoSuchUser(id.0))
    }

    /// The user named `name`.
    pub fn by_name(&self, name: &str) -> Option<&User> {
        self.by_name.get(name).and_then(|id| self.users.get(id))
    }

    /// Iterates users in id order.
    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// The number of known users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Adds a fresh user from join parameters, assigning the next id.
    /// A rejoin of an unavailable user with the same name reuses its id.
    /// Fails with [`Error::NameInUse`] when the name belongs to an
    /// available user.
    pub fn join(&mut self, params: JoinParams, connection: Option<ConnectionId>) -> Result<&User> {
        if params.name.is_empty() {
            return Err(Error::NameMissing);
        }
        if let Some(id) = self.by_name.get(&params.name).copied() {
            let user = self.users.get_mut(&id).ok_or(Error::NoSuchUser(id.0))?;
            if user.status != UserStatus::Unavailable {
                return Err(Error::NameInUse(params.name));
            }
            user.status = UserStatus::Active;
            user.connection = connection;
            user.caret = params.caret;
            user.selection = params.selection;
            user.hue = params.hue;
            return Ok(user);
        }
        let id = UserId(self.next_id);
        self.next_id += 1;
        self.insert(User {
            id,
            name: params.name,
            status: UserStatus::Active,
            connection,
            caret: params.caret,
            selection: params.selection,
            hue: params.hue,
        })
    }

    /// Installs a user record verbatim, e.g. from synchronisation. Keeps
    /// the id counter ahead of every known id.
    pub fn insert(&mut self, user: User) -> Result<&User> {
        if let Some(existing) = self.by_name.get(&user.name) {
            if *existing != user.id {
                return Err(Error::NameInUse(user.name));
            }
        }
        self.next_id = self.next_id.max(user.id.0 + 1);
        self.by_name.insert(user.name.clone(), user.id);
        let id = user.id;
        self.users.insert(id, user);
        Ok(self.users.get(&id).expect("just inserted"))
    }

    /// Marks every user joined through `connection` as unavailable and
    /// returns their ids.
    pub fn drop_connection(&mut self, connection: ConnectionId) -> Vec<UserId> {
        let mut dropped = Vec::new();
        for user in self.users.values_mut() {
            if user.connection == Some(connection) {
                user.status = UserStatus::Unavailable;
                user.connection = None;
                dropped.push(user.id);
            }
        }
        dropped
    }
}
