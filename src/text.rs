//! The text document type: buffer edits as OT requests over the wire.
use crate::connection::ConnectionId;
use crate::session::{DocumentContext, Outbound, Session, SessionDocument};
use crate::user::{User, UserStatus, UserTable};
use crate::xml::XmlElement;
use crate::{Error, Result};
use std::collections::VecDeque;
use tracing::{debug, warn};
use weft_ot::{
    Algorithm, Request, RequestKind, StateVector, TextChunk, TextOperation, UserId,
};

/// Default bound on how far in the past a request may lie, measured as the
/// component sum of the vector difference to the current state.
const DEFAULT_MAX_VDIFF: u64 = 16384;

/// A collaboratively edited text buffer behind a [`Session`].
pub struct TextSession {
    algorithm: Algorithm,
    /// Requests delivered before their causal prerequisites, retried as
    /// the state advances.
    pending: VecDeque<(ConnectionId, Request)>,
    /// Buffer content accumulated during synchronisation.
    staged: Option<TextChunk>,
    max_vdiff: u64,
}

impl TextSession {
    /// Returns an empty document.
    pub fn new() -> Self {
        Self::with_algorithm(Algorithm::new())
    }

    /// Returns a document over an existing engine, e.g. loaded from
    /// storage.
    pub fn with_algorithm(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            pending: VecDeque::new(),
            staged: None,
            max_vdiff: DEFAULT_MAX_VDIFF,
        }
    }

    /// The transformation engine.
    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    /// Mutable access to the transformation engine.
    pub fn algorithm_mut(&mut self) -> &mut Algorithm {
        &mut self.algorithm
    }

    /// The buffer content.
    pub fn text(&self) -> String {
        self.algorithm.buffer().chunk().to_string()
    }

    /// Tightens or relaxes the transformation-distance bound.
    pub fn set_max_vdiff(&mut self, max_vdiff: u64) {
        self.max_vdiff = max_vdiff;
    }

    /// Requests still waiting for causal prerequisites.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn check_vdiff(&self, vector: &StateVector) -> Result<()> {
        let mut distance = 0u64;
        for (user, count) in self.algorithm.current().iter() {
            distance += count.saturating_sub(vector.get(user)) as u64;
        }
        if distance > self.max_vdiff {
            return Err(Error::TooOld);
        }
        Ok(())
    }

    /// Applies one remote request; queues it when causality does not
    /// permit application yet.
    fn receive(
        &mut self,
        origin: ConnectionId,
        request: Request,
        ctx: &mut DocumentContext,
    ) -> Result<()> {
        self.check_vdiff(request.vector())?;
        match self.algorithm.receive_request(&request) {
            Ok(()) => {
                if ctx.is_host {
                    ctx.outbox.push(Outbound::Group {
                        except: Some(origin),
                        element: request_to_xml(&request),
                    });
                }
                self.retry_pending(ctx);
                // Every completed round is a chance to shed acknowledged
                // log prefixes.
                if let Err(err) = self.algorithm.vacuum() {
                    warn!(%err, "vacuum failed");
                }
                Ok(())
            }
            Err(weft_ot::Error::CausalityViolated { .. }) => {
                debug!(user = %request.user(), "buffering out-of-order request");
                self.pending.push_back((origin, request));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replays buffered requests until none makes progress anymore.
    fn retry_pending(&mut self, ctx: &mut DocumentContext) {
        loop {
            let mut progressed = false;
            let mut keep = VecDeque::new();
            while let Some((origin, request)) = self.pending.pop_front() {
                match self.algorithm.receive_request(&request) {
                    Ok(()) => {
                        progressed = true;
                        if ctx.is_host {
                            ctx.outbox.push(Outbound::Group {
                                except: Some(origin),
                                element: request_to_xml(&request),
                            });
                        }
                    }
                    Err(weft_ot::Error::CausalityViolated { .. }) => {
                        keep.push_back((origin, request));
                    }
                    Err(err) => {
                        warn!(%err, "dropping buffered request");
                    }
                }
            }
            self.pending = keep;
            if !progressed || self.pending.is_empty() {
                break;
            }
        }
    }
}

impl Default for TextSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDocument for TextSession {
    fn sync_items(&self) -> Vec<XmlElement> {
        let mut items: Vec<XmlElement> = self
            .algorithm
            .buffer()
            .chunk()
            .segments()
            .map(|segment| {
                XmlElement::new("sync-segment")
                    .with_attr("author", segment.author.0)
                    .with_text(segment.text.clone())
            })
            .collect();
        items.extend(self.algorithm.request_history().map(sync_request_to_xml));
        items
    }

    fn ingest_sync_item(&mut self, element: &XmlElement, _users: &mut UserTable) -> Result<()> {
        match element.name() {
            "sync-segment" => {
                let author = UserId(element.parse_attr("author")?);
                let staged = self.staged.get_or_insert_with(TextChunk::new);
                let at = staged.len();
                staged.insert_text(at, element.text(), author)?;
                Ok(())
            }
            "sync-request" => {
                let request = request_from_xml(element)?;
                self.algorithm.restore_request(request)?;
                Ok(())
            }
            other => Err(Error::UnexpectedMessage(other.to_owned())),
        }
    }

    fn finish_sync(&mut self) -> Result<()> {
        let chunk = self.staged.take().unwrap_or_default();
        self.algorithm.buffer_mut().restore(chunk);
        self.algorithm.finish_restore();
        Ok(())
    }

    fn handle_message(
        &mut self,
        origin: ConnectionId,
        element: &XmlElement,
        ctx: &mut DocumentContext,
    ) -> Result<bool> {
        match element.name() {
            "request" => {
                let request = request_from_xml(element)?;
                match self.receive(origin, request, ctx) {
                    Ok(()) => {}
                    Err(err) if !err.closes_connection() => {
                        // A failed request aborts only itself; tell the
                        // origin and keep the session alive.
                        warn!(%err, "request failed");
                        ctx.outbox.push(Outbound::Direct {
                            connection: origin,
                            element: err.to_request_failed(),
                        });
                    }
                    Err(err) => return Err(err),
                }
                Ok(true)
            }
            "user-color-change" => {
                let id = UserId(element.parse_attr("user")?);
                let hue = element.parse_attr("hue")?;
                ctx.users
                    .get_mut(id)
                    .ok_or(Error::NoSuchUser(id.0))?
                    .hue = hue;
                if ctx.is_host {
                    ctx.outbox.push(Outbound::Group {
                        except: Some(origin),
                        element: element.clone(),
                    });
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn user_status_changed(&mut self, user: &User, _previous: UserStatus) {
        // Every participant needs a request log before their first edit.
        self.algorithm.add_user(user.id);
    }
}

impl Session<TextSession> {
    /// Inserts `text` at `pos` on behalf of the local user `user` and
    /// broadcasts the resulting request.
    pub fn insert_text(&mut self, user: UserId, pos: usize, text: &str) -> Result<()> {
        let operation = TextOperation::Insert {
            pos,
            chunk: TextChunk::from_text(text, user),
        };
        let request = self.doc_mut().algorithm.execute_request(user, operation)?;
        self.broadcast(request_to_xml(&request));
        Ok(())
    }

    /// Erases `len` characters at `pos` on behalf of `user` and broadcasts
    /// the resulting request.
    pub fn erase_text(&mut self, user: UserId, pos: usize, len: usize) -> Result<()> {
        let operation = TextOperation::Delete { pos, len };
        let request = self.doc_mut().algorithm.execute_request(user, operation)?;
        self.broadcast(request_to_xml(&request));
        Ok(())
    }

    /// Undoes `user`'s most recent request and broadcasts it.
    pub fn undo(&mut self, user: UserId) -> Result<()> {
        let request = self.doc_mut().algorithm.undo(user)?;
        self.broadcast(request_to_xml(&request));
        Ok(())
    }

    /// Redoes `user`'s most recent undo and broadcasts it.
    pub fn redo(&mut self, user: UserId) -> Result<()> {
        let request = self.doc_mut().algorithm.redo(user)?;
        self.broadcast(request_to_xml(&request));
        Ok(())
    }

    /// Moves `user`'s caret and broadcasts the change.
    pub fn set_caret(&mut self, user: UserId, caret: usize, selection: i64) -> Result<()> {
        let element = {
            let record = self
                .users_mut()
                .get_mut(user)
                .ok_or(Error::NoSuchUser(user.0))?;
            record.caret = caret;
            record.selection = selection;
            XmlElement::new("user-status-change")
                .with_attr("id", user.0)
                .with_attr("status", record.status.name())
                .with_attr("caret", caret)
                .with_attr("selection", selection)
        };
        self.broadcast(element);
        Ok(())
    }
}

/// Serialises a live request: `<request user time>` wrapping one of
/// `<insert>`, `<delete>`, `<undo/>`, `<redo/>`.
pub fn request_to_xml(request: &Request) -> XmlElement {
    request_into("request", request)
}

fn request_into(tag: &str, request: &Request) -> XmlElement {
    let element = XmlElement::new(tag)
        .with_attr("user", request.user().0)
        .with_attr("time", request.vector());
    match request.kind() {
        RequestKind::Do(operation) => element.with_child(operation_to_xml(operation)),
        RequestKind::Undo => element.with_child(XmlElement::new("undo")),
        RequestKind::Redo => element.with_child(XmlElement::new("redo")),
    }
}

/// Parses a live request.
pub fn request_from_xml(element: &XmlElement) -> Result<Request> {
    let user = UserId(element.parse_attr("user")?);
    let vector = StateVector::parse(element.req_attr("time")?)?;
    let child = element
        .children()
        .first()
        .ok_or_else(|| Error::BadAttribute("request".into(), "empty request".into()))?;
    Ok(match child.name() {
        "undo" => Request::new_undo(user, vector),
        "redo" => Request::new_redo(user, vector),
        _ => Request::new_do(user, vector, operation_from_xml(child, user)?),
    })
}

/// Log entries synchronise in the live request form under their own tag.
fn sync_request_to_xml(request: &Request) -> XmlElement {
    request_into("sync-request", request)
}

/// Serialises an operation. Single-author inserts use bare text; retained
/// delete text and mixed authorship use `<segment>` children.
fn operation_to_xml(operation: &TextOperation) -> XmlElement {
    match operation {
        TextOperation::Insert { pos, chunk } => {
            chunk_into(XmlElement::new("insert").with_attr("pos", *pos), chunk)
        }
        TextOperation::Delete { pos, len } => XmlElement::new("delete")
            .with_attr("pos", *pos)
            .with_attr("len", *len),
        TextOperation::ReversibleDelete { pos, chunk } => {
            chunk_into(XmlElement::new("delete").with_attr("pos", *pos), chunk)
        }
        TextOperation::Split(first, second) => XmlElement::new("split")
            .with_child(operation_to_xml(first))
            .with_child(operation_to_xml(second)),
        TextOperation::Noop => XmlElement::new("no-op"),
    }
}

fn chunk_into(element: XmlElement, chunk: &TextChunk) -> XmlElement {
    let mut segments = chunk.segments();
    match (segments.next(), segments.next()) {
        // The compact form suffices while one author wrote everything.
        (Some(only), None) => element
            .with_attr("author", only.author.0)
            .with_text(only.text.clone()),
        _ => chunk.segments().fold(element, |element, segment| {
            element.with_child(
                XmlElement::new("segment")
                    .with_attr("author", segment.author.0)
                    .with_text(segment.text.clone()),
            )
        }),
    }
}

fn chunk_from(element: &XmlElement, fallback_author: UserId) -> Result<TextChunk> {
    if element.children().is_empty() {
        let author = element
            .parse_opt_attr("author")?
            .map(UserId)
            .unwrap_or(fallback_author);
        return Ok(TextChunk::from_text(element.text(), author));
    }
    let mut chunk = TextChunk::new();
    for segment in element.children() {
        if segment.name() != "segment" {
            return Err(Error::UnexpectedMessage(segment.name().to_owned()));
        }
        let author = UserId(segment.parse_attr("author")?);
        let at = chunk.len();
        chunk.insert_text(at, segment.text(), author)?;
    }
    Ok(chunk)
}

/// Parses an operation element; `fallback_author` attributes inserted text
/// lacking explicit authorship, normally the request's user.
fn operation_from_xml(element: &XmlElement, fallback_author: UserId) -> Result<TextOperation> {
    match element.name() {
        "insert" => Ok(TextOperation::Insert {
            pos: element.parse_attr("pos")?,
            chunk: chunk_from(element, fallback_author)?,
        }),
        "delete" => {
            let pos = element.parse_attr("pos")?;
            match element.parse_opt_attr::<usize>("len")? {
                Some(len) => Ok(TextOperation::Delete { pos, len }),
                None => Ok(TextOperation::ReversibleDelete {
                    pos,
                    chunk: chunk_from(element, fallback_author)?,
                }),
            }
        }
        "split" => {
            let mut children = element.children().iter();
            let (Some(first), Some(second)) = (children.next(), children.next()) else {
                return Err(Error::BadAttribute(
                    "split".into(),
                    "expected two halves".into(),
                ));
            };
            Ok(TextOperation::Split(
                Box::new(operation_from_xml(first, fallback_author)?),
                Box::new(operation_from_xml(second, fallback_author)?),
            ))
        }
        "no-op" => Ok(TextOperation::Noop),
        other => Err(Error::UnexpectedMessage(other.to_owned())),
    }
}
