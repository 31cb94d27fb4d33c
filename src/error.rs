//! The error taxonomy shared by sessions, the communication layer and the
//! server, with its `request-failed` wire mapping.
use crate::xml::XmlElement;
use thiserror::Error;

/// Everything that can go wrong between two weft endpoints.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// Transformation-core failure; aborts one request, not the session.
    #[error(transparent)]
    Ot(#[from] weft_ot::Error),
    /// ACL data failure.
    #[error(transparent)]
    Acl(#[from] weft_acl::Error),

    /// Malformed XML on the stream. Closes the offending connection.
    #[error("malformed xml: {0}")]
    Xml(String),
    /// A required attribute was absent.
    #[error("missing attribute {0:?} on <{1}>")]
    MissingAttribute(String, String),
    /// An attribute failed to parse.
    #[error("malformed attribute {0:?}: {1}")]
    BadAttribute(String, String),
    /// A message tag has no handler in the current state.
    #[error("unexpected message <{0}>")]
    UnexpectedMessage(String),

    /// Synchronisation broke down; the synchronising side closes.
    #[error("synchronization failed: {0}")]
    SyncFailed(String),
    /// The session is not in the state the operation requires.
    #[error("session is {0}, operation requires {1}")]
    InvalidSessionState(String, String),
    /// A user with this name is already joined.
    #[error("user name {0:?} is already in use")]
    NameInUse(String),
    /// A join request carried no name.
    #[error("user join request carries no name")]
    NameMissing,
    /// A join request carried an id, which only the session assigns.
    #[error("user join request must not carry an id")]
    IdProvided,
    /// A join request carried a status, which only the session assigns.
    #[error("user join request must not carry a status")]
    StatusProvided,
    /// The named user does not exist in this session.
    #[error("no user with id {0}")]
    NoSuchUser(u32),
    /// A request referred to a transformation state too far in the past.
    #[error("request predates the retained transformation window")]
    TooOld,

    /// The connection is not subscribed to this group or session.
    #[error("connection is not subscribed")]
    NotSubscribed,
    /// The connection is not in a state that allows the operation.
    #[error("connection is closed")]
    ConnectionClosed,
    /// A group was registered twice for the same connection.
    #[error("group {0:?} is already registered")]
    AlreadyRegistered(String),
    /// An ACL denial. Deliberately carries no further information.
    #[error("not authorized")]
    NotAuthorized,

    /// The directory has no node with this id.
    #[error("no such node {0}")]
    NoSuchNode(u32),
    /// A sibling with this name already exists.
    #[error("a node named {0:?} already exists")]
    DuplicateNodeName(String),
    /// A subdirectory operation hit a leaf or vice versa.
    #[error("node {0} has the wrong kind for this operation")]
    WrongNodeKind(u32),
    /// The account is unknown.
    #[error("no such account {0:?}")]
    NoSuchAccount(String),

    /// Storage failure; logged and reported, never fatal to the server.
    #[error("storage: {0}")]
    Storage(String),

    /// A failure relayed from the remote side with a domain this endpoint
    /// does not know.
    #[error("remote failure in domain {domain:?} (code {code})")]
    Remote {
        /// The remote error domain.
        domain: String,
        /// The domain-specific code.
        code: u32,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The wire domain of this error.
    pub fn domain(&self) -> &str {
        match self {
            Error::Ot(_) => "ot",
            Error::Acl(_) => "acl",
            Error::Xml(_)
            | Error::MissingAttribute(..)
            | Error::BadAttribute(..)
            | Error::UnexpectedMessage(_) => "protocol",
            Error::SyncFailed(_)
            | Error::InvalidSessionState(..)
            | Error::NameInUse(_)
            | Error::NameMissing
            | Error::IdProvided
            | Error::StatusProvided
            | Error::NoSuchUser(_)
            | Error::TooOld => "session",
            Error::NotSubscribed
            | Error::ConnectionClosed
            | Error::AlreadyRegistered(_)
            | Error::NotAuthorized => "communication",
            Error::NoSuchNode(_)
            | Error::DuplicateNodeName(_)
            | Error::WrongNodeKind(_)
            | Error::NoSuchAccount(_) => "directory",
            Error::Storage(_) => "storage",
            Error::Remote { domain, .. } => domain,
        }
    }

    /// The domain-specific wire code of this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Ot(err) => match err {
                weft_ot::Error::InvalidVector(_) => 1,
                weft_ot::Error::InvalidOperation(_) => 2,
                weft_ot::Error::InvalidRequest(_) => 3,
                weft_ot::Error::CausalityViolated { .. } => 4,
                weft_ot::Error::DuplicateRequest { .. } => 5,
                weft_ot::Error::NothingToUndo(_) => 6,
                weft_ot::Error::NothingToRedo(_) => 7,
                weft_ot::Error::UnknownUser(_) => 8,
            },
            Error::Acl(err) => match err {
                weft_acl::Error::UnknownPermission(_) => 1,
                weft_acl::Error::IncompleteRootSheet(_) => 2,
            },
            Error::Xml(_) => 1,
            Error::MissingAttribute(..) => 2,
            Error::BadAttribute(..) => 3,
            Error::UnexpectedMessage(_) => 4,
            Error::SyncFailed(_) => 1,
            Error::InvalidSessionState(..) => 2,
            Error::NameInUse(_) => 3,
            Error::NameMissing => 4,
            Error::IdProvided => 5,
            Error::StatusProvided => 6,
            Error::NoSuchUser(_) => 7,
            Error::TooOld => 8,
            Error::NotSubscribed => 1,
            Error::ConnectionClosed => 2,
            Error::AlreadyRegistered(_) => 3,
            Error::NotAuthorized => 4,
            Error::NoSuchNode(_) => 1,
            Error::DuplicateNodeName(_) => 2,
            Error::WrongNodeKind(_) => 3,
            Error::NoSuchAccount(_) => 4,
            Error::Storage(_) => 1,
            Error::Remote { code, .. } => *code,
        }
    }

    /// Whether the error is fatal to the connection it arrived on.
    /// Transformation errors abort only the offending request.
    pub fn closes_connection(&self) -> bool {
        matches!(self.domain(), "protocol" | "communication")
            && !matches!(self, Error::NotAuthorized)
    }

    /// Builds the `request-failed` element reporting this error.
    pub fn to_request_failed(&self) -> XmlElement {
        XmlElement::new("request-failed")
            .with_attr("domain", self.domain())
            .with_attr("code", self.code())
            .with_attr("message", self)
    }

    /// Reconstructs an error from a received `request-failed` element.
    /// Unknown domains surface as [`Error::Remote`].
    pub fn from_request_failed(element: &XmlElement) -> Result<Error> {
        let domain = element.req_attr("domain")?.to_owned();
        let code: u32 = element.parse_attr("code")?;
        Ok(Error::Remote { domain, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_failed_roundtrip_preserves_domain_and_code() {
        let error = Error::NameInUse("alice".into());
        let wire = error.to_request_failed();
        assert_eq!(wire.attr("domain"), Some("session"));
        assert_eq!(wire.attr("code"), Some("3"));
        let back = Error::from_request_failed(&wire).unwrap();
        assert_eq!(
            back,
            Error::Remote {
                domain: "session".into(),
                code: 3
            }
        );
    }

    #[test]
    fn severity_split_matches_policy() {
        // OT failures abort a request, not the connection.
        assert!(!Error::Ot(weft_ot::Error::NothingToUndo(weft_ot::UserId(1)))
            .closes_connection());
        // Authorization denials do not close either.
        assert!(!Error::NotAuthorized.closes_connection());
        // Protocol violations do.
        assert!(Error::UnexpectedMessage("bogus".into()).closes_connection());
        assert!(Error::Xml("broken".into()).closes_connection());
    }
}
