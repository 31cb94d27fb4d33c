//! The chat document type: a backlog-bearing message stream.
use crate::connection::ConnectionId;
use crate::session::{DocumentContext, Outbound, Session, SessionDocument};
use crate::user::{User, UserStatus, UserTable};
use crate::xml::XmlElement;
use crate::{Error, Result};
use chrono::Local;
use std::collections::VecDeque;
use std::io::Write;
use tracing::warn;
use weft_ot::UserId;

/// Messages retained for synchronisation of late subscribers.
const DEFAULT_BACKLOG: usize = 256;

/// What a chat entry represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChatMessageKind {
    /// An ordinary line.
    Normal,
    /// A `/me` action.
    Emote,
    /// Synthesised locally when a user becomes available.
    UserJoin,
    /// Synthesised locally when a user becomes unavailable.
    UserPart,
}

impl ChatMessageKind {
    /// The wire form. Join/part entries never travel.
    pub fn name(self) -> &'static str {
        match self {
            ChatMessageKind::Normal => "normal",
            ChatMessageKind::Emote => "emote",
            ChatMessageKind::UserJoin => "userjoin",
            ChatMessageKind::UserPart => "userpart",
        }
    }

    fn from_wire(name: &str) -> Result<Self> {
        match name {
            "normal" => Ok(ChatMessageKind::Normal),
            "emote" => Ok(ChatMessageKind::Emote),
            // Join and part entries are synthesised locally on status
            // changes and must never arrive unsolicited.
            other => Err(Error::BadAttribute(
                "type".into(),
                format!("unknown message type {:?}", other),
            )),
        }
    }
}

/// One chat entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChatMessage {
    /// The speaking user.
    pub user: UserId,
    /// Display name at the time of the message.
    pub name: String,
    /// Entry kind.
    pub kind: ChatMessageKind,
    /// The line itself; empty for join/part entries.
    pub text: String,
}

/// A chat stream behind a [`Session`].
pub struct ChatSession {
    backlog: VecDeque<ChatMessage>,
    capacity: usize,
    sink: Option<Box<dyn Write + Send>>,
}

impl ChatSession {
    /// Returns a chat with the default backlog bound.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BACKLOG)
    }

    /// Returns a chat retaining at most `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            backlog: VecDeque::new(),
            capacity,
            sink: None,
        }
    }

    /// Attaches a log sink receiving one human-readable line per entry.
    pub fn set_log_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.sink = Some(sink);
    }

    /// The retained messages, oldest first.
    pub fn backlog(&self) -> impl Iterator<Item = &ChatMessage> {
        self.backlog.iter()
    }

    fn push(&mut self, message: ChatMessage) {
        self.log_line(&message);
        self.backlog.push_back(message);
        while self.backlog.len() > self.capacity {
            self.backlog.pop_front();
        }
    }

    fn log_line(&mut self, message: &ChatMessage) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let stamp = Local::now().format("%H:%M:%S");
        let line = match message.kind {
            ChatMessageKind::Normal => {
                format!("[{}] <{}> {}\n", stamp, message.name, message.text)
            }
            ChatMessageKind::Emote => {
                format!("[{}] * {} {}\n", stamp, message.name, message.text)
            }
            ChatMessageKind::UserJoin => {
                format!("[{}] --> {} has joined\n", stamp, message.name)
            }
            ChatMessageKind::UserPart => {
                format!("[{}] <-- {} has left\n", stamp, message.name)
            }
        };
        // Log-file trouble must not disturb the chat itself.
        if let Err(err) = sink.write_all(line.as_bytes()) {
            warn!(%err, "chat log sink failed");
            self.sink = None;
        }
    }

    fn message_to_xml(message: &ChatMessage) -> XmlElement {
        XmlElement::new("message")
            .with_attr("user", message.user.0)
            .with_attr("type", message.kind.name())
            .with_text(message.text.clone())
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDocument for ChatSession {
    fn sync_items(&self) -> Vec<XmlElement> {
        self.backlog
            .iter()
            .filter(|m| {
                matches!(m.kind, ChatMessageKind::Normal | ChatMessageKind::Emote)
            })
            .map(|m| {
                XmlElement::new("sync-message")
                    .with_attr("user", m.user.0)
                    .with_attr("name", m.name.clone())
                    .with_attr("type", m.kind.name())
                    .with_text(m.text.clone())
            })
            .collect()
    }

    fn ingest_sync_item(&mut self, element: &XmlElement, _users: &mut UserTable) -> Result<()> {
        if element.name() != "sync-message" {
            return Err(Error::UnexpectedMessage(element.name().to_owned()));
        }
        let message = ChatMessage {
            user: UserId(element.parse_attr("user")?),
            name: element.req_attr("name")?.to_owned(),
            kind: ChatMessageKind::from_wire(element.req_attr("type")?)?,
            text: element.text().to_owned(),
        };
        self.backlog.push_back(message);
        while self.backlog.len() > self.capacity {
            self.backlog.pop_front();
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        origin: ConnectionId,
        element: &XmlElement,
        ctx: &mut DocumentContext,
    ) -> Result<bool> {
        if element.name() != "message" {
            return Ok(false);
        }
        let user = UserId(element.parse_attr("user")?);
        let kind = ChatMessageKind::from_wire(element.req_attr("type")?)?;
        let name = ctx.users.require(user)?.name.clone();
        self.push(ChatMessage {
            user,
            name,
            kind,
            text: element.text().to_owned(),
        });
        if ctx.is_host {
            ctx.outbox.push(Outbound::Group {
                except: Some(origin),
                element: element.clone(),
            });
        }
        Ok(true)
    }

    fn user_status_changed(&mut self, user: &User, previous: UserStatus) {
        let kind = match (previous, user.status) {
            (UserStatus::Unavailable, UserStatus::Active)
            | (UserStatus::Unavailable, UserStatus::Inactive) => ChatMessageKind::UserJoin,
            (UserStatus::Active, UserStatus::Unavailable)
            | (UserStatus::Inactive, UserStatus::Unavailable) => ChatMessageKind::UserPart,
            _ => return,
        };
        self.push(ChatMessage {
            user: user.id,
            name: user.name.clone(),
            kind,
            text: String::new(),
        });
    }
}

impl Session<ChatSession> {
    /// Says `text` as `user` and broadcasts it.
    pub fn say(&mut self, user: UserId, text: &str) -> Result<()> {
        self.send_chat(user, text, ChatMessageKind::Normal)
    }

    /// Emotes `text` as `user` and broadcasts it.
    pub fn emote(&mut self, user: UserId, text: &str) -> Result<()> {
        self.send_chat(user, text, ChatMessageKind::Emote)
    }

    fn send_chat(&mut self, user: UserId, text: &str, kind: ChatMessageKind) -> Result<()> {
        let name = self.users().require(user)?.name.clone();
        let message = ChatMessage {
            user,
            name,
            kind,
            text: text.to_owned(),
        };
        let element = ChatSession::message_to_xml(&message);
        self.doc_mut().push(message);
        self.broadcast(element);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::user::JoinParams;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn host() -> (Session<ChatSession>, UserId) {
        let mut session = Session::new_host(ChatSession::new());
        let alice = session
            .join_user(
                JoinParams {
                    name: "alice".into(),
                    ..JoinParams::default()
                },
                Some(ConnectionId(1)),
            )
            .unwrap()
            .unwrap();
        session.drain_outbox();
        (session, alice)
    }

    #[test]
    fn messages_land_in_backlog_and_rebroadcast() {
        let (mut session, alice) = host();
        let element = XmlElement::new("message")
            .with_attr("user", alice.0)
            .with_attr("type", "normal")
            .with_text("hello there");
        session.handle_element(ConnectionId(1), &element).unwrap();
        let backlog: Vec<_> = session.doc().backlog().collect();
        // The join entry was synthesised, the spoken line arrived.
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].kind, ChatMessageKind::UserJoin);
        assert_eq!(backlog[1].text, "hello there");
        let out = session.drain_outbox();
        assert!(matches!(
            &out[..],
            [Outbound::Group { except: Some(origin), .. }]
                if *origin == ConnectionId(1)
        ));
    }

    #[test]
    fn join_and_part_entries_never_come_from_the_wire() {
        let (mut session, alice) = host();
        let element = XmlElement::new("message")
            .with_attr("user", alice.0)
            .with_attr("type", "userjoin");
        assert!(matches!(
            session.handle_element(ConnectionId(1), &element),
            Err(Error::BadAttribute(..))
        ));
    }

    #[test]
    fn backlog_is_bounded() {
        let mut session = Session::new_host(ChatSession::with_capacity(3));
        let alice = session
            .join_user(
                JoinParams {
                    name: "alice".into(),
                    ..JoinParams::default()
                },
                None,
            )
            .unwrap()
            .unwrap();
        for i in 0..10 {
            session.say(alice, &format!("line {}", i)).unwrap();
        }
        let backlog: Vec<_> = session.doc().backlog().collect();
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog[0].text, "line 7");
        assert_eq!(backlog[2].text, "line 9");
    }

    #[test]
    fn synchronization_replays_the_backlog() {
        let (mut host, alice) = host();
        host.say(alice, "one").unwrap();
        host.emote(alice, "waves").unwrap();
        host.drain_outbox();

        host.synchronize_to(ConnectionId(9)).unwrap();
        let mut client = Session::new_joined(ChatSession::new());
        client.synchronize_from(ConnectionId(1)).unwrap();
        for outbound in host.drain_outbox() {
            if let Outbound::Direct { element, .. } = outbound {
                client.handle_element(ConnectionId(1), &element).unwrap();
            }
        }
        assert_eq!(client.status(), SessionStatus::Running);
        let backlog: Vec<_> = client.doc().backlog().collect();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].text, "one");
        assert_eq!(backlog[1].kind, ChatMessageKind::Emote);
        assert_eq!(backlog[1].name, "alice");
    }

    #[test]
    fn log_sink_receives_formatted_lines() {
        let sink = SharedSink::default();
        let (mut session, alice) = host();
        session
            .doc_mut()
            .set_log_sink(Box::new(sink.clone()));
        session.say(alice, "logged").unwrap();
        let content = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(content.contains("<alice> logged"));
        assert!(content.starts_with('['));
    }
}
